//! Keyward Proxy - metering gateway between applications and LLM providers.
//!
//! Registered applications call the gateway with their application id as
//! bearer token. The gateway resolves the provider key bound to the
//! application, forwards the call with the real key, and appends one usage
//! record to the ledger per call.
//!
//! ## Architecture
//!
//! ```text
//! App Request → Bearer → Application (granted?) → Bound Key
//!                                                      │
//!                                                      ▼
//!                                               Upstream Provider
//!                                                      │
//!                                 ┌────────────────────┴────────────────────┐
//!                                 │ JSON                                    │ SSE
//!                                 ▼                                         ▼
//!                          Read, extract usage                   Relay task: ingest chunks,
//!                                 │                              forward to client
//!                                 ▼                                         │
//!                           UsageMeter::record ◄────────────────────────────┘
//! ```

mod error;
pub mod extractor;
mod gateway;
mod meter;

pub use error::{ProxyError, Result};
pub use extractor::{extract_buffered_usage, extract_model, ExtractedUsage, UsageExtractor};
pub use gateway::{is_streaming, target_url, Gateway, GatewayRequest};
pub use meter::UsageMeter;
