//! provflow - stream/batch classification of provenance completion events

pub mod pipeline;
