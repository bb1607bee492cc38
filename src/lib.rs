/*
 * frontrace - Connection racing transport core for front-end forwarding proxies.
 * Copyright (C) 2025  frontrace contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Transport core of a front-end forwarding proxy: raced and pooled
//! connections to a trusted set of front-end IPs, a background prober that
//! keeps that set healthy, and a range-fetch engine that reassembles large
//! downloads from parallel partial requests.

pub mod config;
pub mod error;
pub mod iplist;
pub mod logging;
pub mod prober;
pub mod range;
pub mod service;
pub mod transport;

pub use config::Config;
pub use error::{TransportError, TransportResult};
pub use iplist::IpList;
pub use prober::IpProber;
pub use range::RangeFetch;
pub use service::ServiceHandle;
pub use transport::TransportStack;
