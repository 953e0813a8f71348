#![no_main]

use exam_monitor_client::event_stream::{FrameParser, StreamEvent};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Feed the input in two uneven chunks so frames straddle the boundary.
    let split = data.first().map_or(0, |b| usize::from(*b)).min(data.len());
    let (head, tail) = data.split_at(split);

    let mut parser = FrameParser::new();
    let mut frames = parser.push(head);
    frames.extend(parser.push(tail));
    for frame in &frames {
        let _ = StreamEvent::from_frame(frame);
    }
});
