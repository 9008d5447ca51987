//! HTTP API: job routes over a [`backfill_infra::JobHost`].

pub mod app;
