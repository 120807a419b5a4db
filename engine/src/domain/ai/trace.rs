//! Bounded request traces
//!
//! The last N AI requests with truncated previews, kept in memory for the
//! monitoring dashboard. Previews are hard-capped (12 KB responses, 1 KB
//! errors) before storage.

use parking_lot::Mutex;
use serde::Serialize;

use crate::core::constants::{
    TRACE_BUFFER_CAPACITY, TRACE_ERROR_PREVIEW_MAX, TRACE_RESPONSE_PREVIEW_MAX,
};
use crate::data::topics::RingBuffer;
use crate::utils::string::truncate_chars;
use crate::utils::time::now_ms;

use super::runtime::Capability;

/// One recorded AI request
#[derive(Debug, Clone, Serialize)]
pub struct RequestTrace {
    pub at_ms: i64,
    pub capability: String,
    pub operation: String,
    pub model: String,
    pub status: String,
    pub duration_ms: i64,
    pub response_preview: Option<String>,
    pub error_preview: Option<String>,
    /// File paths of the images sent with the request
    pub image_uris: Vec<String>,
}

/// Bounded in-memory trace recorder
pub struct TraceRecorder {
    traces: Mutex<RingBuffer<RequestTrace>>,
}

impl Default for TraceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self {
            traces: Mutex::new(RingBuffer::new(TRACE_BUFFER_CAPACITY)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        capability: Capability,
        operation: &str,
        model: &str,
        status: &str,
        duration_ms: i64,
        response_preview: Option<&str>,
        error_preview: Option<&str>,
        image_uris: Vec<String>,
    ) {
        let trace = RequestTrace {
            at_ms: now_ms(),
            capability: capability.as_str().to_string(),
            operation: operation.to_string(),
            model: model.to_string(),
            status: status.to_string(),
            duration_ms,
            response_preview: response_preview
                .map(|p| truncate_chars(p, TRACE_RESPONSE_PREVIEW_MAX)),
            error_preview: error_preview.map(|p| truncate_chars(p, TRACE_ERROR_PREVIEW_MAX)),
            image_uris,
        };
        self.traces.lock().push(trace);
    }

    /// Recent traces, newest first
    pub fn recent(&self, n: usize) -> Vec<RequestTrace> {
        self.traces.lock().recent(n).into_iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_previews_are_capped() {
        let recorder = TraceRecorder::new();
        let huge_response = "r".repeat(TRACE_RESPONSE_PREVIEW_MAX * 2);
        let huge_error = "e".repeat(TRACE_ERROR_PREVIEW_MAX * 2);
        recorder.record(
            Capability::Vlm,
            "batch",
            "m",
            "failed",
            10,
            Some(&huge_response),
            Some(&huge_error),
            vec!["/tmp/a.png".to_string()],
        );

        let traces = recorder.recent(1);
        assert_eq!(
            traces[0].response_preview.as_ref().unwrap().len(),
            TRACE_RESPONSE_PREVIEW_MAX
        );
        assert_eq!(
            traces[0].error_preview.as_ref().unwrap().len(),
            TRACE_ERROR_PREVIEW_MAX
        );
    }

    #[test]
    fn test_buffer_bounded_newest_first() {
        let recorder = TraceRecorder::new();
        for i in 0..TRACE_BUFFER_CAPACITY + 10 {
            recorder.record(
                Capability::Text,
                &format!("op{i}"),
                "m",
                "succeeded",
                1,
                None,
                None,
                vec![],
            );
        }
        let traces = recorder.recent(TRACE_BUFFER_CAPACITY + 10);
        assert_eq!(traces.len(), TRACE_BUFFER_CAPACITY);
        assert_eq!(traces[0].operation, format!("op{}", TRACE_BUFFER_CAPACITY + 9));
    }
}
