pub mod fs_atomic;
pub mod http;
pub mod ids;
pub mod logging;
pub mod serde_ext;

pub use http::{HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, UreqHttpClient};
pub use ids::{new_flow_execution_id, normalize_module_identifier, now_rfc3339};
