use rand::Rng;

/// Bounds for the size of the first segment of a replayed hello.
pub const MIN_SPLIT: usize = 32;
pub const MAX_SPLIT: usize = 64;

const TLS_RECORD_HEADER_LEN: usize = 5;
const TLS_CONTENT_TYPE_HANDSHAKE: u8 = 22;

/// Segments a buffered hello for replay, one wire packet per segment.
///
/// The hello is split at `s = uniform[32, 64]`, capped at half the hello.
/// If the first segment starts with a TLS handshake record, that record is
/// additionally fragmented into two records, yielding the five-segment form
/// `[hdr1, payload_a, hdr2, payload_b, rest]`.
///
/// Returns the segments together with `s`, the size of the first retried
/// segment as recorded in [`RetryStats`](crate::RetryStats).
pub fn split_hello<R: Rng>(hello: &[u8], rng: &mut R) -> (Vec<Vec<u8>>, usize) {
    if hello.is_empty() {
        return (Vec::new(), 0);
    }

    let s = rng.gen_range(MIN_SPLIT..=MAX_SPLIT).min(hello.len() / 2);

    let (first, rest) = hello.split_at(s);

    if let Some(segments) = fragment_tls_record(first, rest, rng) {
        return (segments, s);
    }

    (vec![first.to_vec(), rest.to_vec()], s)
}

/// Splits a leading TLS handshake record in `first` into two records.
///
/// The record's declared length may exceed the payload present in `first`
/// (the hello can end mid-record); it is fragmented regardless and the two
/// emitted length fields sum to the declared length.
fn fragment_tls_record<R: Rng>(first: &[u8], rest: &[u8], rng: &mut R) -> Option<Vec<Vec<u8>>> {
    if first.len() <= 6 {
        return None;
    }

    // Content type "handshake", legacy version 0x0301..=0x0304.
    if first[0] != TLS_CONTENT_TYPE_HANDSHAKE || first[1] != 3 || !(1..=4).contains(&first[2]) {
        return None;
    }

    let record_len = u16::from_be_bytes([first[3], first[4]]) as usize;
    let payload = &first[TLS_RECORD_HEADER_LEN..];

    if record_len < payload.len() {
        return None;
    }

    let frag = rng.gen_range(1..payload.len());
    let (payload_a, payload_b) = payload.split_at(frag);

    Some(vec![
        record_header(first, frag),
        payload_a.to_vec(),
        record_header(first, record_len - frag),
        payload_b.to_vec(),
        rest.to_vec(),
    ])
}

fn record_header(original: &[u8], len: usize) -> Vec<u8> {
    let len = len as u16;

    vec![
        original[0],
        original[1],
        original[2],
        len.to_be_bytes()[0],
        len.to_be_bytes()[1],
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;
    use rand::{SeedableRng as _, rngs::StdRng};

    use super::*;

    fn client_hello(payload_len: usize) -> Vec<u8> {
        let mut hello = vec![22, 3, 1];
        hello.extend_from_slice(&(payload_len as u16).to_be_bytes());
        hello.extend((0..payload_len).map(|i| i as u8));

        hello
    }

    #[test]
    fn empty_hello_is_preserved() {
        let (segments, s) = split_hello(&[], &mut StdRng::seed_from_u64(0));

        assert!(segments.is_empty());
        assert_eq!(s, 0);
    }

    #[test]
    fn tls_hello_yields_five_segments() {
        let hello = client_hello(200);

        let (segments, s) = split_hello(&hello, &mut StdRng::seed_from_u64(1));

        assert_eq!(segments.len(), 5);
        assert!((MIN_SPLIT..=MAX_SPLIT).contains(&s));

        // Record-length fields sum to the original record length.
        let len1 = u16::from_be_bytes([segments[0][3], segments[0][4]]) as usize;
        let len2 = u16::from_be_bytes([segments[2][3], segments[2][4]]) as usize;
        assert_eq!(len1 + len2, 200);

        // The payload bytes survive re-framing.
        let mut payload = segments[1].clone();
        payload.extend_from_slice(&segments[3]);
        payload.extend_from_slice(&segments[4]);
        assert_eq!(payload, hello[5..]);
    }

    #[test]
    fn truncated_tls_record_is_still_fragmented() {
        // Declared length exceeds the payload present in the first segment.
        let mut hello = vec![22, 3, 3];
        hello.extend_from_slice(&500u16.to_be_bytes());
        hello.extend(std::iter::repeat_n(0xAB, 95)); // 100-byte hello, record claims 500.

        let (segments, _) = split_hello(&hello, &mut StdRng::seed_from_u64(2));

        assert_eq!(segments.len(), 5);

        let len1 = u16::from_be_bytes([segments[0][3], segments[0][4]]) as usize;
        let len2 = u16::from_be_bytes([segments[2][3], segments[2][4]]) as usize;
        assert_eq!(len1 + len2, 500);
    }

    #[test]
    fn non_tls_hello_splits_in_two() {
        let hello = vec![0x16; 3]; // Too short for a record header check.

        let (segments, s) = split_hello(&hello, &mut StdRng::seed_from_u64(3));

        assert_eq!(segments.len(), 2);
        assert_eq!(s, 1); // 3 / 2.
        assert_eq!([segments[0].as_slice(), segments[1].as_slice()].concat(), hello);
    }

    proptest! {
        #[test]
        fn first_segment_is_within_bounds(
            hello in prop::collection::vec(any::<u8>(), 1..4096),
            seed in any::<u64>(),
        ) {
            let (segments, s) = split_hello(&hello, &mut StdRng::seed_from_u64(seed));

            let lower = MIN_SPLIT.min(hello.len() / 2);
            let upper = MAX_SPLIT.min(hello.len() / 2);
            prop_assert!(s >= lower && s <= upper);

            let reassembled = reassemble(&segments);
            prop_assert_eq!(reassembled.len(), hello.len());
        }

        #[test]
        fn tls_payload_is_preserved(
            payload in prop::collection::vec(any::<u8>(), 2..2048),
            seed in any::<u64>(),
        ) {
            let mut hello = vec![22, 3, 1];
            hello.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            hello.extend_from_slice(&payload);

            let (segments, s) = split_hello(&hello, &mut StdRng::seed_from_u64(seed));

            if segments.len() == 5 {
                let mut out = segments[1].clone();
                out.extend_from_slice(&segments[3]);
                out.extend_from_slice(&segments[4]);
                prop_assert_eq!(out, hello[5..].to_vec());

                let len1 = u16::from_be_bytes([segments[0][3], segments[0][4]]) as usize;
                let len2 = u16::from_be_bytes([segments[2][3], segments[2][4]]) as usize;
                prop_assert_eq!(len1 + len2, payload.len());
            } else {
                // The split point landed inside the record header.
                prop_assert!(s <= 6);
            }
        }
    }

    fn reassemble(segments: &[Vec<u8>]) -> Vec<u8> {
        if segments.len() == 5 {
            let mut out = segments[1].clone();
            out.extend_from_slice(&segments[3]);
            out.extend_from_slice(&segments[4]);
            // Account for the two record headers replacing the original one.
            let mut framed = vec![0u8; 5];
            framed.extend_from_slice(&out);
            return framed;
        }

        segments.concat()
    }
}
