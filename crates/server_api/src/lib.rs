use std::sync::Arc;

use serde_json::Value;
use shared::{
    domain::{Direction, DEFAULT_AMOUNT, MAX_AMOUNT},
    error::ApiError,
    protocol::CountResponse,
};
use storage::{CounterStore, StoreError};
use tracing::{info, warn};

#[derive(Clone)]
pub struct ApiContext {
    pub store: Arc<dyn CounterStore>,
}

impl ApiContext {
    pub fn new(store: impl CounterStore + 'static) -> Self {
        Self {
            store: Arc::new(store),
        }
    }
}

/// Extracts the amount of an increment/decrement body.
///
/// An empty body, a missing `value` or `null` all mean [`DEFAULT_AMOUNT`].
pub fn parse_amount(body: &[u8]) -> Result<u64, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(DEFAULT_AMOUNT);
    }

    let payload: Value = serde_json::from_slice(body)
        .map_err(|err| ApiError::invalid_amount(format!("request body is not JSON: {err}")))?;
    let Value::Object(fields) = payload else {
        return Err(ApiError::invalid_amount("request body must be a JSON object"));
    };

    match fields.get("value") {
        None | Some(Value::Null) => Ok(DEFAULT_AMOUNT),
        Some(Value::Number(number)) => number
            .as_u64()
            .filter(|amount| *amount <= MAX_AMOUNT)
            .ok_or_else(|| {
                ApiError::invalid_amount(format!(
                    "value must be a whole number between 0 and {MAX_AMOUNT}, got {number}"
                ))
            }),
        Some(other) => Err(ApiError::invalid_amount(format!(
            "value must be a number, got {other}"
        ))),
    }
}

pub async fn read_count(ctx: &ApiContext) -> Result<CountResponse, ApiError> {
    let count = ctx
        .store
        .get()
        .await
        .map_err(|err| storage_error("get", err))?;
    Ok(CountResponse { count })
}

pub async fn adjust_count(
    ctx: &ApiContext,
    direction: Direction,
    amount: u64,
) -> Result<CountResponse, ApiError> {
    let result = match direction {
        Direction::Increase => ctx.store.increment(amount).await,
        Direction::Decrease => ctx.store.decrement(amount).await,
    };
    let count = result.map_err(|err| match direction {
        Direction::Increase => storage_error("increment", err),
        Direction::Decrease => storage_error("decrement", err),
    })?;
    info!(?direction, amount, count, "count adjusted");
    Ok(CountResponse { count })
}

pub async fn increment_count(ctx: &ApiContext, amount: u64) -> Result<CountResponse, ApiError> {
    adjust_count(ctx, Direction::Increase, amount).await
}

pub async fn decrement_count(ctx: &ApiContext, amount: u64) -> Result<CountResponse, ApiError> {
    adjust_count(ctx, Direction::Decrease, amount).await
}

pub async fn reset_count(ctx: &ApiContext) -> Result<CountResponse, ApiError> {
    let count = ctx
        .store
        .reset()
        .await
        .map_err(|err| storage_error("reset", err))?;
    info!("count reset");
    Ok(CountResponse { count })
}

fn storage_error(operation: &'static str, err: StoreError) -> ApiError {
    warn!(operation, error = %err, "counter store rejected operation");
    ApiError::new(err.code(), format!("Failed to {operation} count: {err}"))
}
