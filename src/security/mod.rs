pub mod safe_check;
pub mod signature;

pub use safe_check::{SafeCheckConfig, Verdict, is_form_content_type, is_sql_injection, scan_request};
pub use signature::{SIGN_PARAM, SignatureEngine, SignatureError, TIMESTAMP_PARAM};
