//! Property-based coverage of the sliding-window slot arena, using the
//! generator strategies from `usenet-engine-generators`.

use bytes::Bytes;
use proptest::prelude::*;
use usenet_engine::streamer::window::SegmentWindow;
use usenet_engine::usage::{UsageContext, UsageKind};
use usenet_engine_generators::{segment_ids, uniform_segment_sizes};

proptest! {
    /// For any segment list and buffer size, sliding the window onto each
    /// segment in turn, marking it in flight, then ready, always yields back
    /// exactly the bytes that were stored for it.
    #[test]
    fn window_reassembles_every_segment_in_order(
        ids in segment_ids(1..16),
        buffer_size in 1usize..8,
    ) {
        let total = ids.len();
        let sizes = uniform_segment_sizes(total, 64, 64 * total as u64);
        let mut window = SegmentWindow::new(total, buffer_size);

        for seq in 0..total {
            window.slide_to(seq, buffer_size);
            prop_assert!(!window.is_settled(seq));

            let ctx = UsageContext::new(UsageKind::BufferedStreaming);
            window.mark_in_flight(seq, ctx);
            prop_assert!(window.is_in_flight(seq));
            prop_assert!(!window.is_settled(seq));

            let payload = Bytes::from(vec![(seq % 256) as u8; sizes[seq] as usize]);
            window.mark_ready(seq, payload.clone());
            prop_assert!(window.is_settled(seq));
            prop_assert!(!window.is_in_flight(seq));

            let taken = window.take_settled(seq).expect("slot was just marked ready");
            let bytes = taken.expect("no failure was injected for this slot");
            prop_assert_eq!(bytes, payload);
        }
    }

    /// A slot still in flight is never reported as a straggler before the
    /// (rolling-average-derived) deadline has elapsed.
    #[test]
    fn fresh_in_flight_slot_is_never_an_immediate_straggler(
        ids in segment_ids(1..8),
    ) {
        let total = ids.len();
        let mut window = SegmentWindow::new(total, total);
        let ctx = UsageContext::new(UsageKind::BufferedStreaming);
        window.mark_in_flight(0, ctx);
        prop_assert!(window.stragglers().is_empty());
    }
}
