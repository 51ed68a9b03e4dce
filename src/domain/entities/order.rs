use chrono::{DateTime, Utc};
use mongodb::bson::{self, oid::ObjectId, Document};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{AppError, Result};

/// A typed record stored in one collection, validated before it is written.
pub trait Entity: Serialize + DeserializeOwned {
    const COLLECTION: &'static str;

    fn validate(&self) -> Result<()>;

    fn to_document(&self) -> Result<Document> {
        self.validate()?;
        Ok(bson::to_document(self)?)
    }

    fn from_document(document: Document) -> Result<Self> {
        Ok(bson::from_document(document)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub product_id: ObjectId,
    pub quantity: i32,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn new(product_id: ObjectId, quantity: i32) -> Self {
        Self {
            id: ObjectId::new(),
            product_id,
            quantity,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

impl Entity for Order {
    const COLLECTION: &'static str = "orders";

    fn validate(&self) -> Result<()> {
        if self.quantity < 1 {
            return Err(AppError::ValidationError(format!(
                "Order quantity must be at least 1, got {}",
                self.quantity
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub name: String,
    pub price: f64,
    pub stock: i32,
    pub created_at: DateTime<Utc>,
}

impl Product {
    pub fn new(name: impl Into<String>, price: f64, stock: i32) -> Self {
        Self {
            id: ObjectId::new(),
            name: name.into(),
            price,
            stock,
            created_at: Utc::now(),
        }
    }
}

impl Entity for Product {
    const COLLECTION: &'static str = "products";

    fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.name.trim().is_empty() {
            problems.push("name is required".to_string());
        }
        if !self.price.is_finite() || self.price < 0.0 {
            problems.push(format!("price must be >= 0, got {}", self.price));
        }
        if self.stock < 0 {
            problems.push(format!("stock must be >= 0, got {}", self.stock));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(AppError::ValidationError(format!(
                "Invalid product: {}",
                problems.join(", ")
            )))
        }
    }
}
