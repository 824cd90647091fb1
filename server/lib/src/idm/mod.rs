//! The Identity Management components of the server. Each protocol head is
//! a submodule consuming the shared stores and validators.

pub mod oauth2;
