use axum::{extract::State, http::StatusCode, response::Json};
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    domain::{Order, OrderStatus},
    error::{AppError, Result},
    AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    pub product_id: String,
    pub quantity: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub id: String,
    pub product_id: String,
    pub quantity: i32,
    pub status: OrderStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        Self {
            id: order.id.to_hex(),
            product_id: order.product_id.to_hex(),
            quantity: order.quantity,
            status: order.status,
            created_at: order.created_at,
        }
    }
}

pub fn parse_object_id(raw: &str) -> Result<ObjectId> {
    ObjectId::parse_str(raw).map_err(|_| AppError::BadRequest(format!("Invalid id '{}'", raw)))
}

pub async fn place_order(
    State(state): State<AppState>,
    Json(request): Json<PlaceOrderRequest>,
) -> Result<(StatusCode, Json<OrderResponse>)> {
    info!("🔄 Placing order for product {}", request.product_id);

    let product_id = parse_object_id(&request.product_id)?;
    let order = state.orders.place_order(product_id, request.quantity).await?;

    Ok((StatusCode::CREATED, Json(order.into())))
}
