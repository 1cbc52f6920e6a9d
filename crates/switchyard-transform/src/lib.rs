pub mod context;
pub mod request;
pub mod response;
pub mod stream;
pub mod tokens;


pub(crate) fn new_tool_use_id() -> String {
    format!("toolu_{}", uuid::Uuid::new_v4().simple())
}

pub(crate) fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}
