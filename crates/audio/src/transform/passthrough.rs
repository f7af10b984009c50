use super::TransformStage;
use crate::error::AudioResult;
use crate::format::StreamFormat;
use crate::frame::Frame;

/// Reicht Frames unveraendert durch
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl TransformStage for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn output_format(&self, input: &StreamFormat) -> AudioResult<StreamFormat> {
        Ok(input.clone())
    }

    fn apply(&mut self, frame: Frame) -> AudioResult<Frame> {
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unveraendert() {
        let frame = Frame::new(3, vec![9u8; 6]);
        assert_eq!(Passthrough.apply(frame.clone()).unwrap(), frame);
        let enc = StreamFormat::Encoded { codec: "opus".into() };
        assert_eq!(Passthrough.output_format(&enc).unwrap(), enc);
    }
}
