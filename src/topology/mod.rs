// SPDX-License-Identifier: Apache-2.0

pub mod batch;
pub mod fanout;
pub mod payload;
pub mod span_buffer;
