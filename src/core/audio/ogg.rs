//! Incremental Ogg page demuxer.
//!
//! Reassembles logical packets (e.g. Opus frames) from a byte stream of Ogg
//! pages that may arrive split at arbitrary boundaries. The demuxer keeps the
//! unparsed tail of the stream and the packet currently being laced between
//! calls to [`OggDemuxer::push`].
//!
//! # Page layout
//!
//! ```text
//! offset  size  field
//! 0       4     capture pattern "OggS"
//! 4       22    version, header type, granule, serial, sequence, checksum
//! 26      1     segment count (N)
//! 27      N     lacing values
//! 27+N    sum   payload
//! ```
//!
//! A lacing value of 255 means the packet continues into the next segment
//! (possibly on a later page). Any smaller value, zero included, terminates it.

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, warn};

/// Capture pattern that starts every page.
pub const OGG_CAPTURE_PATTERN: &[u8; 4] = b"OggS";

/// Size of the fixed page header, up to and including the segment count.
pub const OGG_HEADER_LEN: usize = 27;

/// Offset of the segment count inside the fixed header.
const SEGMENT_COUNT_OFFSET: usize = 26;

/// Lacing value that continues the current packet.
const CONTINUATION_LACING: u8 = 255;

/// Default cap on resident unparsed bytes (1 MiB).
pub const DEFAULT_MAX_BUFFER: usize = 1 << 20;

/// Stateful Ogg demuxer for one logical stream.
#[derive(Debug)]
pub struct OggDemuxer {
    /// Bytes received but not yet consumed as a complete page.
    pending: BytesMut,
    /// Packet currently being laced together.
    packet: BytesMut,
    /// Upper bound for `pending`.
    max_buffer: usize,
}

impl Default for OggDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl OggDemuxer {
    /// Creates a demuxer with the default buffer cap.
    pub fn new() -> Self {
        Self::with_max_buffer(DEFAULT_MAX_BUFFER)
    }

    /// Creates a demuxer with a custom buffer cap. Zero selects the default.
    pub fn with_max_buffer(max_buffer: usize) -> Self {
        let max_buffer = if max_buffer == 0 {
            DEFAULT_MAX_BUFFER
        } else {
            max_buffer
        };
        Self {
            pending: BytesMut::new(),
            packet: BytesMut::new(),
            max_buffer,
        }
    }

    /// Maximum number of unparsed bytes kept between pushes.
    #[inline]
    pub fn max_buffer(&self) -> usize {
        self.max_buffer
    }

    /// Number of unparsed bytes currently held.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Clears all state, ready for a new logical stream.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.packet.clear();
    }

    /// Feeds a chunk of the page stream and returns every packet completed by it,
    /// in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(chunk);
        self.enforce_max_buffer();

        let mut packets = Vec::new();
        loop {
            let Some(start) = find_capture(&self.pending) else {
                break;
            };
            if start > 0 {
                debug!(skipped = start, "Dropping bytes before Ogg capture pattern");
                self.pending.advance(start);
            }

            if self.pending.len() < OGG_HEADER_LEN {
                break;
            }
            let segments = self.pending[SEGMENT_COUNT_OFFSET] as usize;
            let header_len = OGG_HEADER_LEN + segments;
            if self.pending.len() < header_len {
                break;
            }
            let payload_len: usize = self.pending[OGG_HEADER_LEN..header_len]
                .iter()
                .map(|&lacing| lacing as usize)
                .sum();
            if self.pending.len() < header_len + payload_len {
                break;
            }

            let page = self.pending.split_to(header_len + payload_len).freeze();
            self.consume_page(&page, segments, &mut packets);
        }
        packets
    }

    /// Walks the lacing table of a complete page, emitting terminated packets.
    fn consume_page(&mut self, page: &Bytes, segments: usize, out: &mut Vec<Bytes>) {
        let lacing = &page[OGG_HEADER_LEN..OGG_HEADER_LEN + segments];
        let mut offset = OGG_HEADER_LEN + segments;
        for &value in lacing {
            let len = value as usize;
            self.packet.extend_from_slice(&page[offset..offset + len]);
            offset += len;
            if value < CONTINUATION_LACING {
                out.push(self.packet.split().freeze());
            }
        }
    }

    /// Keeps `pending` within `max_buffer`, preferring to resynchronize on the
    /// last capture pattern before truncating blindly.
    fn enforce_max_buffer(&mut self) {
        if self.pending.len() <= self.max_buffer {
            return;
        }
        if let Some(last) = rfind_capture(&self.pending)
            && last > 0
        {
            self.pending.advance(last);
        }
        if self.pending.len() > self.max_buffer {
            let excess = self.pending.len() - self.max_buffer;
            self.pending.advance(excess);
        }
        warn!(
            buffered = self.pending.len(),
            max_buffer = self.max_buffer,
            "Ogg demuxer buffer exceeded its cap, discarded unparsed bytes"
        );
    }
}

fn find_capture(buf: &[u8]) -> Option<usize> {
    buf.windows(OGG_CAPTURE_PATTERN.len())
        .position(|w| w == OGG_CAPTURE_PATTERN)
}

fn rfind_capture(buf: &[u8]) -> Option<usize> {
    buf.windows(OGG_CAPTURE_PATTERN.len())
        .rposition(|w| w == OGG_CAPTURE_PATTERN)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds one page with the given lacing table and payload.
    fn page(lacing: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; OGG_HEADER_LEN];
        out[..4].copy_from_slice(OGG_CAPTURE_PATTERN);
        out[SEGMENT_COUNT_OFFSET] = lacing.len() as u8;
        out.extend_from_slice(lacing);
        out.extend_from_slice(payload);
        out
    }

    /// Laces whole packets into a single page.
    fn page_of_packets(packets: &[&[u8]]) -> Vec<u8> {
        let mut lacing = Vec::new();
        let mut payload = Vec::new();
        for p in packets {
            let mut remaining = p.len();
            while remaining >= 255 {
                lacing.push(255);
                remaining -= 255;
            }
            lacing.push(remaining as u8);
            payload.extend_from_slice(p);
        }
        page(&lacing, &payload)
    }

    #[test]
    fn test_packet_spanning_two_pages() {
        let mut demux = OggDemuxer::new();

        let head = b"OpusHead";
        let tags = b"OpusTags";
        let first = b"AAAA";
        let long = vec![1u8; 300];

        let mut payload = Vec::new();
        payload.extend_from_slice(head);
        payload.extend_from_slice(tags);
        payload.extend_from_slice(first);
        payload.extend_from_slice(&long[..255]);
        let page1 = page(&[8, 8, 4, 255], &payload);
        let page2 = page(&[45], &long[255..]);

        let out1 = demux.push(&page1);
        assert_eq!(out1.len(), 3);
        assert_eq!(&out1[0][..], head);
        assert_eq!(&out1[1][..], tags);
        assert_eq!(&out1[2][..], first);

        let out2 = demux.push(&page2);
        assert_eq!(out2.len(), 1);
        assert_eq!(out2[0].len(), 300);
        assert_eq!(demux.buffered(), 0);
    }

    #[test]
    fn test_chunking_does_not_change_output() {
        let a = vec![7u8; 10];
        let b = vec![9u8; 600];
        let c = vec![3u8; 255];
        let d: Vec<u8> = (0..=200).collect();
        let mut stream = page_of_packets(&[&a, &b]);
        stream.extend(page_of_packets(&[&c, &d]));
        stream.extend(page_of_packets(&[b"tail"]));

        let mut whole = OggDemuxer::new();
        let expected = whole.push(&stream);
        assert_eq!(expected.len(), 5);
        assert_eq!(&expected[1][..], &b[..]);
        assert_eq!(&expected[2][..], &c[..]);

        for chunk_size in [1, 2, 3, 26, 27, 28, 100, 257, 1000] {
            let mut demux = OggDemuxer::new();
            let mut got = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                got.extend(demux.push(chunk));
            }
            assert_eq!(got, expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn test_zero_lacing_terminates_empty_packet() {
        let mut demux = OggDemuxer::new();
        let out = demux.push(&page(&[0, 3], b"abc"));
        assert_eq!(out.len(), 2);
        assert!(out[0].is_empty());
        assert_eq!(&out[1][..], b"abc");
    }

    #[test]
    fn test_zero_lacing_after_255_terminates_exact_multiple() {
        let mut demux = OggDemuxer::new();
        let payload = vec![5u8; 255];
        let out = demux.push(&page(&[255, 0], &payload));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 255);
    }

    #[test]
    fn test_all_continuation_run_waits_for_terminator() {
        let mut demux = OggDemuxer::new();
        let chunk = vec![2u8; 255 * 3];
        assert!(demux.push(&page(&[255, 255, 255], &chunk)).is_empty());
        assert!(demux.push(&page(&[255], &chunk[..255])).is_empty());

        let out = demux.push(&page(&[10], &[4u8; 10]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 255 * 4 + 10);
    }

    #[test]
    fn test_garbage_before_first_page_is_skipped() {
        let mut demux = OggDemuxer::new();
        let mut data = b"garbage-bytes".to_vec();
        data.extend(page_of_packets(&[b"hello"]));
        let out = demux.push(&data);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], b"hello");
    }

    #[test]
    fn test_incomplete_header_waits() {
        let mut demux = OggDemuxer::new();
        let data = page_of_packets(&[b"payload"]);
        assert!(demux.push(&data[..20]).is_empty());
        assert_eq!(demux.buffered(), 20);
        assert!(demux.push(&data[20..29]).is_empty());
        let out = demux.push(&data[29..]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_unrecognized_input_stays_within_cap() {
        let mut demux = OggDemuxer::with_max_buffer(1024);
        let junk = vec![0xABu8; 700];
        for _ in 0..50 {
            assert!(demux.push(&junk).is_empty());
            assert!(demux.buffered() <= 1024);
        }
    }

    #[test]
    fn test_overflow_resyncs_on_last_capture_pattern() {
        let mut demux = OggDemuxer::with_max_buffer(64);
        let mut data = vec![0u8; 100];
        let valid = page_of_packets(&[b"sync"]);
        data.extend_from_slice(&valid);

        let out = demux.push(&data);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], b"sync");
        assert_eq!(demux.buffered(), 0);
    }

    #[test]
    fn test_reset_clears_partial_state() {
        let mut demux = OggDemuxer::new();
        let data = page(&[255], &[1u8; 255]);
        assert!(demux.push(&data).is_empty());
        demux.push(&page_of_packets(&[b"x"])[..10]);
        demux.reset();
        assert_eq!(demux.buffered(), 0);
        assert!(demux.push(&[]).is_empty());

        let out = demux.push(&page_of_packets(&[b"fresh"]));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], b"fresh");
    }

    #[test]
    fn test_zero_max_buffer_uses_default() {
        let demux = OggDemuxer::with_max_buffer(0);
        assert_eq!(demux.max_buffer(), DEFAULT_MAX_BUFFER);
    }
}
