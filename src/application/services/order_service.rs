use mongodb::bson::{doc, oid::ObjectId};
use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    core::OperationMonitor,
    domain::{Entity, Order, OrderStatus, Product, TransactionOutcome, UnitOfWork},
    error::{AppError, Result},
    infrastructure::database::{ConnectionSupervisor, TransactionCoordinator},
};

/// Position of the stock guard inside the order unit.
const STOCK_STEP: usize = 1;

/// Order placement and product bookkeeping on top of the supervised store.
///
/// Every call goes through the [`OperationMonitor`] so it shows up in the
/// performance report.
#[derive(Clone)]
pub struct OrderService {
    supervisor: Arc<ConnectionSupervisor>,
    coordinator: Arc<TransactionCoordinator>,
    monitor: Arc<OperationMonitor>,
}

impl OrderService {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        coordinator: Arc<TransactionCoordinator>,
        monitor: Arc<OperationMonitor>,
    ) -> Self {
        Self {
            supervisor,
            coordinator,
            monitor,
        }
    }

    /// Inserts the order, takes the stock and completes the order in one
    /// transaction. Insufficient stock or an unknown product leaves nothing
    /// behind.
    pub async fn place_order(&self, product_id: ObjectId, quantity: i32) -> Result<Order> {
        let mut order = Order::new(product_id, quantity);

        let unit = UnitOfWork::new("place_order")
            .insert(&order)?
            .update_matching(
                Product::COLLECTION,
                doc! { "_id": product_id, "stock": { "$gte": quantity } },
                doc! { "$inc": { "stock": -quantity } },
            )
            .update_matching(
                Order::COLLECTION,
                doc! { "_id": order.id },
                doc! { "$set": { "status": "completed" } },
            );

        self.monitor
            .measure("place_order", async {
                match self.coordinator.run(unit).await? {
                    TransactionOutcome::Aborted { reason, .. }
                        if reason.operation_index == Some(STOCK_STEP)
                            && matches!(reason.error, AppError::ValidationError(_)) =>
                    {
                        Err(self.stock_shortfall(product_id, quantity).await)
                    }
                    outcome => outcome.into_result(),
                }
            })
            .await?;

        order.status = OrderStatus::Completed;
        info!(order_id = %order.id, product_id = %product_id, quantity, "✅ Order placed");
        Ok(order)
    }

    /// Tells a missing product apart from one without enough stock after the
    /// stock guard matched nothing.
    async fn stock_shortfall(&self, product_id: ObjectId, quantity: i32) -> AppError {
        let product = match self.supervisor.admit().await {
            Ok(guard) => {
                guard
                    .store()
                    .find_one(Product::COLLECTION, doc! { "_id": product_id })
                    .await
            }
            Err(e) => Err(e),
        };

        match product {
            Ok(None) => AppError::NotFound(format!("Product {} not found", product_id)),
            Ok(Some(_)) => AppError::ValidationError(format!(
                "Insufficient stock for product {}: requested {}",
                product_id, quantity
            )),
            Err(e) => {
                warn!(product_id = %product_id, "Could not look up product after stock guard failed: {}", e);
                AppError::ValidationError(format!(
                    "Insufficient stock for product {}: requested {}",
                    product_id, quantity
                ))
            }
        }
    }

    pub async fn create_product(&self, product: Product) -> Result<Product> {
        let document = product.to_document()?;

        self.monitor
            .measure("create_product", async {
                let guard = self.supervisor.admit().await?;
                guard.store().insert_one(Product::COLLECTION, document).await
            })
            .await?;

        info!(product_id = %product.id, name = %product.name, "Product created");
        Ok(product)
    }

    pub async fn find_product(&self, id: ObjectId) -> Result<Product> {
        let document = self
            .monitor
            .measure("find_product", async {
                let guard = self.supervisor.admit().await?;
                guard
                    .store()
                    .find_one(Product::COLLECTION, doc! { "_id": id })
                    .await
            })
            .await?;

        match document {
            Some(document) => Product::from_document(document),
            None => Err(AppError::NotFound(format!("Product {} not found", id))),
        }
    }

    pub async fn find_order(&self, id: ObjectId) -> Result<Option<Order>> {
        let document = self
            .monitor
            .measure("find_order", async {
                let guard = self.supervisor.admit().await?;
                guard
                    .store()
                    .find_one(Order::COLLECTION, doc! { "_id": id })
                    .await
            })
            .await?;

        document.map(Order::from_document).transpose()
    }

    pub async fn count_orders(&self) -> Result<u64> {
        self.monitor
            .measure("count_orders", async {
                let guard = self.supervisor.admit().await?;
                guard.store().count_documents(Order::COLLECTION, doc! {}).await
            })
            .await
    }

    pub fn monitor(&self) -> &Arc<OperationMonitor> {
        &self.monitor
    }
}

