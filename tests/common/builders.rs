//! Test data builders for streams and requests

use camera_pipeline::{
    BufferHandle, Metadata, Request, RequestTemplate, StreamConfig, StreamId, StreamKind,
};

pub const PREVIEW: u32 = 0;
pub const CAPTURE: u32 = 1;
pub const INPUT: u32 = 2;

/// Builder for a stream set
#[derive(Default)]
pub struct StreamSetBuilder {
    streams: Vec<StreamConfig>,
}

impl StreamSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preview(mut self) -> Self {
        self.streams
            .push(StreamConfig::new(PREVIEW, StreamKind::Preview, 64, 48));
        self
    }

    pub fn capture(mut self) -> Self {
        self.streams
            .push(StreamConfig::new(CAPTURE, StreamKind::Capture, 128, 96));
        self
    }

    pub fn input(mut self) -> Self {
        self.streams
            .push(StreamConfig::new(INPUT, StreamKind::Input, 128, 96));
        self
    }

    pub fn build(self) -> Vec<StreamConfig> {
        self.streams
    }
}

/// Builder for requests with predictable buffer handles
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    pub fn new(frame_number: u32) -> Self {
        Self {
            request: Request::new(frame_number),
        }
    }

    /// Preview output with handle `frame_number * 10`
    pub fn preview(mut self) -> Self {
        let handle = self.handle(0);
        self.request = self.request.with_output(StreamId(PREVIEW), handle);
        self
    }

    /// Still output with handle `frame_number * 10 + 1`
    pub fn capture(mut self) -> Self {
        let handle = self.handle(1);
        self.request = self.request.with_output(StreamId(CAPTURE), handle);
        self
    }

    /// Input buffer with handle `frame_number * 10 + 2`
    pub fn input(mut self) -> Self {
        let handle = self.handle(2);
        self.request = self.request.with_input(StreamId(INPUT), handle);
        self
    }

    pub fn template(mut self, template: RequestTemplate) -> Self {
        self.request = self
            .request
            .with_settings(camera_pipeline::construct_default_settings(template));
        self
    }

    pub fn settings(mut self, settings: Metadata) -> Self {
        self.request = self.request.with_settings(settings);
        self
    }

    pub fn build(self) -> Request {
        self.request
    }

    fn handle(&self, slot: u64) -> BufferHandle {
        BufferHandle(self.request.frame_number as u64 * 10 + slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = RequestBuilder::new(3).preview().capture().build();
        assert_eq!(request.outputs.len(), 2);
        assert_eq!(request.outputs[1].handle, BufferHandle(31));
        assert!(request.input.is_none());
    }
}
