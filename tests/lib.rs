//! Integration test suite for the user-management acceptance harness.
//!
//! Tests drive whole scenarios through [`usermgmt_harness::Harness`] against
//! the in-memory bus, store, identity platform and user service.
//!
//! ## Organization
//!
//! - `common`: logging setup and fixtures shared by every test
//! - `integration::scenarios`: end-to-end workflow scenarios, alone and
//!   concurrently
//! - `integration::correlation`: watermark, at-most-once delivery,
//!   teardown and decode-failure behavior of the correlation engine
//! - `integration::readiness`: readiness waits before a run
//! - `integration::identity`: identity bootstrap and its failure steps
//! - `integration::workflows`: staff, user group, import and password
//!   reissue workflows

extern crate usermgmt_harness;

pub mod common;
pub mod integration;
