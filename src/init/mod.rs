// SPDX-License-Identifier: Apache-2.0

pub mod agent;
pub mod config;
pub mod exporters;
pub mod parse;
pub mod receivers;
pub mod wait;
