pub mod booking;
pub mod call;
pub mod echo;
pub mod executor;
pub mod plugin;
pub mod registry;
pub mod schema;
pub mod spec;

pub use booking::{Booking, BookingBook, CancelBookingTool, CreateBookingTool, GetBookingTool};
pub use call::{new_correlation_id, ToolCallRequest, ToolError, ToolErrorKind, ToolResult};
pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use plugin::PluginTool;
pub use registry::{Tool, ToolRegistry, RESERVED_TOOL_NAMES};
pub use schema::tool_call_schema_json;
pub use spec::{FieldSpec, FieldType, SchemaViolation, ToolSpec};
