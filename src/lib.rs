//! A bulk email campaign manager: campaigns, their recipients, reusable templates, and the
//! dispatcher that renders and sends a campaign's mail.

#[macro_use]
extern crate diesel;
#[macro_use]
extern crate log;

#[macro_use]
mod macros;

pub mod config;
pub mod db;
pub mod dispatch;
mod errors;
pub mod importer;
pub mod mailer;
pub mod render;
pub mod util;
pub mod web;

pub use crate::config::Config;
pub use crate::db::DB;
pub use crate::dispatch::Dispatcher;
pub use crate::errors::{Error, ErrorKind, Result};
pub use crate::mailer::{LogTransport, Mailer, Transport};
pub use crate::render::Renderer;
pub use crate::web::{routes, State};
