//! HTTP route handlers outside the `/auth` flows.
//!
//! Handlers are annotated with `#[openapi]` so `rocket_okapi` can derive
//! the OpenAPI document; access policy is declared through the `Gate`
//! guard in each signature.

pub mod account;
pub mod admin;
pub mod health;
