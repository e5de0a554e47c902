//! 餐厅预订工具：create_booking / cancel_booking / get_booking
//!
//! 三个工具共享同一个内存预订簿（BookingBook）。create / cancel 有副作用，不幂等；get 幂等。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::tools::{FieldSpec, FieldType, Tool, ToolSpec};

type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub booking_id: String,
    pub guests: u32,
    /// HH:MM（24 小时制）
    pub time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    pub cancelled: bool,
}

/// 内存预订簿
#[derive(Clone)]
pub struct BookingBook {
    bookings: Arc<Mutex<BTreeMap<String, Booking>>>,
    next_id: IdGenerator,
}

impl BookingBook {
    pub fn new() -> Self {
        Self::with_id_generator(|| {
            uuid::Uuid::new_v4()
                .simple()
                .to_string()
                .to_uppercase()
                .chars()
                .take(6)
                .collect()
        })
    }

    /// 指定 booking id 生成方式（测试中用固定 id）
    pub fn with_id_generator(f: impl Fn() -> String + Send + Sync + 'static) -> Self {
        Self {
            bookings: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: Arc::new(f),
        }
    }

    pub async fn get(&self, booking_id: &str) -> Option<Booking> {
        self.bookings.lock().await.get(booking_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.bookings.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn create(&self, guests: u32, time: String, name: Option<String>, date: Option<String>) -> Booking {
        let booking = Booking {
            booking_id: (self.next_id)(),
            guests,
            time,
            name,
            date,
            cancelled: false,
        };
        self.bookings
            .lock()
            .await
            .insert(booking.booking_id.clone(), booking.clone());
        booking
    }

    async fn cancel(&self, booking_id: &str) -> Result<Booking, String> {
        let mut bookings = self.bookings.lock().await;
        let booking = bookings
            .get_mut(booking_id)
            .ok_or_else(|| format!("no booking with id {booking_id}"))?;
        if booking.cancelled {
            return Err(format!("booking {booking_id} is already cancelled"));
        }
        booking.cancelled = true;
        Ok(booking.clone())
    }

    /// 注册全部预订工具
    pub fn tools(&self) -> Vec<Arc<dyn Tool>> {
        vec![
            Arc::new(CreateBookingTool::new(self.clone())),
            Arc::new(CancelBookingTool::new(self.clone())),
            Arc::new(GetBookingTool::new(self.clone())),
        ]
    }
}

impl Default for BookingBook {
    fn default() -> Self {
        Self::new()
    }
}

/// 接受 "19:00"、"7:05" 等写法，统一成 HH:MM
fn normalize_time(raw: &str) -> Result<String, String> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map(|t| t.format("%H:%M").to_string())
        .map_err(|_| format!("time must be HH:MM (24h), got `{raw}`"))
}

fn str_arg(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

pub struct CreateBookingTool {
    book: BookingBook,
    spec: ToolSpec,
}

impl CreateBookingTool {
    pub fn new(book: BookingBook) -> Self {
        Self {
            book,
            spec: ToolSpec::new("create_booking", "Create a restaurant table booking.")
                .input(FieldSpec::required("guests", FieldType::Integer, "number of guests, at least 1"))
                .input(FieldSpec::required("time", FieldType::String, "booking time, HH:MM 24h"))
                .input(FieldSpec::optional("name", FieldType::String, "name for the booking"))
                .input(FieldSpec::optional("date", FieldType::String, "date, YYYY-MM-DD"))
                .output(FieldSpec::required("booking_id", FieldType::String, "booking reference")),
        }
    }
}

#[async_trait]
impl Tool for CreateBookingTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let guests = args.get("guests").and_then(|v| v.as_u64()).unwrap_or(0);
        if guests == 0 || guests > u32::MAX as u64 {
            return Err("guests must be a positive integer".to_string());
        }
        let time = normalize_time(&str_arg(&args, "time").unwrap_or_default())?;
        let booking = self
            .book
            .create(guests as u32, time, str_arg(&args, "name"), str_arg(&args, "date"))
            .await;
        tracing::info!(booking_id = %booking.booking_id, guests = booking.guests, "booking created");
        Ok(json!({
            "booking_id": booking.booking_id,
            "guests": booking.guests,
            "time": booking.time,
        }))
    }
}

pub struct CancelBookingTool {
    book: BookingBook,
    spec: ToolSpec,
}

impl CancelBookingTool {
    pub fn new(book: BookingBook) -> Self {
        Self {
            book,
            spec: ToolSpec::new("cancel_booking", "Cancel an existing booking by id.")
                .input(FieldSpec::required("booking_id", FieldType::String, "booking reference"))
                .output(FieldSpec::required("cancelled", FieldType::Boolean, "true when cancelled")),
        }
    }
}

#[async_trait]
impl Tool for CancelBookingTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let id = str_arg(&args, "booking_id").unwrap_or_default();
        let booking = self.book.cancel(&id).await?;
        tracing::info!(booking_id = %booking.booking_id, "booking cancelled");
        Ok(json!({ "booking_id": booking.booking_id, "cancelled": true }))
    }
}

pub struct GetBookingTool {
    book: BookingBook,
    spec: ToolSpec,
}

impl GetBookingTool {
    pub fn new(book: BookingBook) -> Self {
        Self {
            book,
            spec: ToolSpec::new("get_booking", "Look up a booking by id.")
                .input(FieldSpec::required("booking_id", FieldType::String, "booking reference"))
                .output(FieldSpec::required("booking", FieldType::Object, "the booking record")),
        }
    }
}

#[async_trait]
impl Tool for GetBookingTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn idempotent(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let id = str_arg(&args, "booking_id").unwrap_or_default();
        let booking = self
            .book
            .get(&id)
            .await
            .ok_or_else(|| format!("no booking with id {id}"))?;
        serde_json::to_value(booking).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_cancel() {
        let book = BookingBook::with_id_generator(|| "ABC123".to_string());
        let create = CreateBookingTool::new(book.clone());
        let out = create
            .execute(json!({"guests": 2, "time": "7:00"}))
            .await
            .unwrap();
        assert_eq!(out["booking_id"], "ABC123");
        assert_eq!(out["time"], "07:00");

        let cancel = CancelBookingTool::new(book.clone());
        cancel.execute(json!({"booking_id": "ABC123"})).await.unwrap();
        assert!(book.get("ABC123").await.unwrap().cancelled);
        assert!(cancel.execute(json!({"booking_id": "ABC123"})).await.is_err());
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let create = CreateBookingTool::new(BookingBook::new());
        assert!(create.execute(json!({"guests": 0, "time": "19:00"})).await.is_err());
        assert!(create.execute(json!({"guests": 2, "time": "7pm"})).await.is_err());
    }

    #[tokio::test]
    async fn test_default_ids_are_short_uppercase() {
        let book = BookingBook::new();
        let create = CreateBookingTool::new(book.clone());
        let out = create.execute(json!({"guests": 4, "time": "20:30"})).await.unwrap();
        let id = out["booking_id"].as_str().unwrap();
        assert_eq!(id.len(), 6);
        assert_eq!(id, id.to_uppercase());
        assert_eq!(book.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_missing_booking_fails() {
        let get = GetBookingTool::new(BookingBook::new());
        assert!(get.execute(json!({"booking_id": "NOPE"})).await.is_err());
        assert!(get.idempotent());
    }
}
