//! Catalog boundary: products, warehouses and per-tenant stock policy.
//!
//! The product/warehouse master data is owned by another system; the ledger
//! only asks these questions, always scoped to one tenant.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use rust_decimal::Decimal;

use stockledger_core::{ProductId, TenantId, WarehouseId};
use stockledger_inventory::StockKey;

pub trait Catalog: Send + Sync {
    fn product_exists(&self, tenant_id: TenantId, product_id: ProductId) -> bool;

    fn warehouse_exists(&self, tenant_id: TenantId, warehouse_id: WarehouseId) -> bool;

    fn is_lot_tracked(&self, tenant_id: TenantId, product_id: ProductId) -> bool;

    /// Whether outbound movements may drive positions below zero.
    fn allows_negative_stock(&self, tenant_id: TenantId) -> bool;

    /// Alert threshold for one position, if configured.
    fn minimum_stock(&self, key: &StockKey) -> Option<Decimal>;
}

impl<C> Catalog for Arc<C>
where
    C: Catalog + ?Sized,
{
    fn product_exists(&self, tenant_id: TenantId, product_id: ProductId) -> bool {
        (**self).product_exists(tenant_id, product_id)
    }

    fn warehouse_exists(&self, tenant_id: TenantId, warehouse_id: WarehouseId) -> bool {
        (**self).warehouse_exists(tenant_id, warehouse_id)
    }

    fn is_lot_tracked(&self, tenant_id: TenantId, product_id: ProductId) -> bool {
        (**self).is_lot_tracked(tenant_id, product_id)
    }

    fn allows_negative_stock(&self, tenant_id: TenantId) -> bool {
        (**self).allows_negative_stock(tenant_id)
    }

    fn minimum_stock(&self, key: &StockKey) -> Option<Decimal> {
        (**self).minimum_stock(key)
    }
}

#[derive(Debug, Default)]
struct CatalogData {
    /// `(tenant, product) -> lot tracked`
    products: HashMap<(TenantId, ProductId), bool>,
    warehouses: HashSet<(TenantId, WarehouseId)>,
    negative_stock: HashSet<TenantId>,
    minimums: HashMap<StockKey, Decimal>,
}

/// In-memory tenant-isolated catalog for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    inner: RwLock<CatalogData>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_product(&self, tenant_id: TenantId, product_id: ProductId, lot_tracked: bool) {
        if let Ok(mut data) = self.inner.write() {
            data.products.insert((tenant_id, product_id), lot_tracked);
        }
    }

    pub fn add_warehouse(&self, tenant_id: TenantId, warehouse_id: WarehouseId) {
        if let Ok(mut data) = self.inner.write() {
            data.warehouses.insert((tenant_id, warehouse_id));
        }
    }

    pub fn set_negative_stock(&self, tenant_id: TenantId, allowed: bool) {
        if let Ok(mut data) = self.inner.write() {
            if allowed {
                data.negative_stock.insert(tenant_id);
            } else {
                data.negative_stock.remove(&tenant_id);
            }
        }
    }

    pub fn set_minimum_stock(&self, key: StockKey, minimum: Decimal) {
        if let Ok(mut data) = self.inner.write() {
            data.minimums.insert(key, minimum);
        }
    }

    fn read<T>(&self, f: impl FnOnce(&CatalogData) -> T) -> Option<T> {
        self.inner.read().ok().map(|data| f(&data))
    }
}

impl Catalog for InMemoryCatalog {
    fn product_exists(&self, tenant_id: TenantId, product_id: ProductId) -> bool {
        self.read(|d| d.products.contains_key(&(tenant_id, product_id)))
            .unwrap_or(false)
    }

    fn warehouse_exists(&self, tenant_id: TenantId, warehouse_id: WarehouseId) -> bool {
        self.read(|d| d.warehouses.contains(&(tenant_id, warehouse_id)))
            .unwrap_or(false)
    }

    fn is_lot_tracked(&self, tenant_id: TenantId, product_id: ProductId) -> bool {
        self.read(|d| d.products.get(&(tenant_id, product_id)).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    fn allows_negative_stock(&self, tenant_id: TenantId) -> bool {
        self.read(|d| d.negative_stock.contains(&tenant_id))
            .unwrap_or(false)
    }

    fn minimum_stock(&self, key: &StockKey) -> Option<Decimal> {
        self.read(|d| d.minimums.get(key).copied()).flatten()
    }
}
