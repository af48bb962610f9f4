// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates trace context through envelope headers: publishing injects the
//! current context, consuming extracts it and opens a consumer span under it.
//! With the default no-op global propagator both directions are inert.

use crate::transport::{HeaderValue, Headers};
use opentelemetry::{
    global::{self, BoxedSpan},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;

/// Instrumentation scope name of the spans opened by this crate.
pub const TRACER_NAME: &str = "bunnybus";

/// Adapter for injecting and extracting OpenTelemetry context from envelope headers.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .insert(key.to_lowercase(), HeaderValue::String(value));
    }
}

impl Extractor for HeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(HeaderValue::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Writes the current trace context into `headers`.
pub fn inject(headers: &mut Headers) {
    let ctx = Context::current();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut HeaderPropagator::new(headers))
    });
}

/// Opens a consumer span named `name`, parented by the context carried in `headers`.
pub fn new_span(headers: &Headers, name: &str) -> (Context, BoxedSpan) {
    let mut carrier = headers.clone();
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderPropagator::new(&mut carrier))
    });

    let tracer = global::tracer(TRACER_NAME);
    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(&tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propagator_reads_string_headers_only() {
        let mut headers = Headers::new();
        headers.insert("traceparent".into(), HeaderValue::from("00-abc-def-01"));
        headers.insert("retryCount".into(), HeaderValue::Int(1));

        let propagator = HeaderPropagator::new(&mut headers);
        assert_eq!(propagator.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(propagator.get("retryCount"), None);
        assert_eq!(propagator.keys().len(), 2);
    }

    #[test]
    fn injector_lowercases_keys() {
        let mut headers = Headers::new();
        HeaderPropagator::new(&mut headers).set("TraceParent", "x".into());
        assert_eq!(headers.get("traceparent"), Some(&HeaderValue::from("x")));
    }

    #[test]
    fn noop_propagation_is_inert() {
        let mut headers = Headers::new();
        inject(&mut headers);
        assert!(headers.is_empty());

        let (_ctx, _span) = new_span(&headers, "orders");
    }
}
