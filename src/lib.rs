// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod addrmap;
pub mod builder;
pub mod dbglog;
mod filter;
pub mod index;
pub mod ranges;
pub mod reader;
pub mod record;

/// Type-erased error type.
///
/// Errors produced by the external collaborators (range decoder, line-table
/// reader) are handed to the core through this type so that their concrete
/// error types never leak into our interface.
pub type AnyError = Box<dyn std::error::Error + Send + Sync>;

/// Virtual address in the ELF / mach-O address space.
pub type VirtAddr = u64;
