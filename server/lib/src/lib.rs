//! The Oxidmd server library. This implements the internal components of the
//! identity provider which process authorisation requests and issue grants.

#![deny(warnings)]
#![recursion_limit = "512"]
#![warn(unused_extern_crates)]
// Enable some groups of clippy lints.
#![deny(clippy::suspicious)]
#![deny(clippy::perf)]
// Specific lints to enforce.
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]
#![deny(clippy::disallowed_types)]
#![deny(clippy::manual_let_else)]
#![allow(clippy::unreachable)]

#[macro_use]
extern crate tracing;
#[macro_use]
extern crate lazy_static;

pub mod idm;

/// A prelude of imports that should be imported by all other Oxidm modules to
/// help make imports cleaner.
pub mod prelude {
    pub use limning::{
        admin_debug, admin_error, admin_info, admin_warn, request_error, request_info,
        request_trace, request_warn, security_access, security_critical, security_error,
        security_info, tagged_event, EventTag,
    };
    pub use oxidm_proto::constants::*;
    pub use oxidm_proto::internal::OperationError;
    pub use std::time::Duration;
    pub use url::Url;
    pub use uuid::{uuid, Uuid};
}
