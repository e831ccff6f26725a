//! Cross-chunk streaming search/replace
//!
//! A [`ReplacingTransform`] applies non-overlapping replacements over a byte
//! stream fed chunk by chunk, emitting exactly the bytes that replacing over
//! the concatenated input would produce. To keep matches that straddle chunk
//! boundaries intact, the transform retains a trailing padding of up to
//! `max_search_len - 1` bytes until the next chunk (or EOF) resolves the
//! boundary. A configurable look-behind window exposes the last bytes of the
//! *emitted* stream to context-sensitive search callbacks.

use std::io;

use crate::codec::BodyTransform;

/// Search callback: given the unsearched buffer, the look-behind window and
/// the EOF flag, return the match position, the matched length, and the
/// replacement bytes. `None` means no match in this buffer.
pub type SearchFn = Box<dyn FnMut(&[u8], &[u8], bool) -> Option<(usize, usize, Vec<u8>)> + Send>;

/// Plain subslice search.
pub fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

pub struct ReplacingTransform {
    search_fn: SearchFn,
    max_search_len: usize,
    look_behind_size: usize,

    padding_len: usize,
    padding_buf: Vec<u8>,
    look_behind_buf: Vec<u8>,
    eof: bool,
}

impl ReplacingTransform {
    pub fn new(search_fn: SearchFn, max_search_len: usize, look_behind_size: usize) -> Self {
        Self {
            search_fn,
            max_search_len,
            look_behind_size,
            padding_len: max_search_len.saturating_sub(1),
            padding_buf: Vec::new(),
            look_behind_buf: Vec::new(),
            eof: false,
        }
    }

    /// Literal search and replace. An empty search degrades to pass-through.
    pub fn new_literal(search: &[u8], replace: &[u8]) -> Self {
        let search = search.to_vec();
        let replace = replace.to_vec();
        let max_search_len = search.len();
        let search_fn: SearchFn = Box::new(move |buf, _look_behind, _eof| {
            find_subslice(buf, &search).map(|idx| (idx, search.len(), replace.clone()))
        });
        Self::new(search_fn, max_search_len, 0)
    }

    /// Apply all matches over `s`, returning the rewritten bytes and the
    /// output position just past the last replacement (if any). The position
    /// bounds the padding so replaced output is never rescanned.
    fn replace_all(&mut self, s: &[u8]) -> (Vec<u8>, Option<usize>) {
        let mut result: Vec<u8> = Vec::new();
        let mut last_match_end: Option<usize> = None;
        let mut look_behind = self.look_behind_buf.clone();
        let mut start = 0;

        loop {
            match (self.search_fn)(&s[start..], &look_behind, self.eof) {
                None => {
                    if last_match_end.is_none() {
                        return (s.to_vec(), None);
                    }
                    result.extend_from_slice(&s[start..]);
                    break;
                }
                Some((idx, old_len, replacement)) => {
                    if replacement.len() < self.look_behind_size && idx > 0 {
                        // otherwise the replacement alone fills the window
                        look_behind = update_look_behind(
                            self.look_behind_size,
                            &look_behind,
                            &s[start..start + idx],
                        );
                    }
                    if !replacement.is_empty() {
                        look_behind =
                            update_look_behind(self.look_behind_size, &look_behind, &replacement);
                    }

                    result.extend_from_slice(&s[start..start + idx]);
                    result.extend_from_slice(&replacement);
                    last_match_end = Some(result.len());

                    start += idx + old_len;
                }
            }
        }

        (result, last_match_end)
    }
}

/// Keep the trailing `size` bytes of the stream across `old` and `new_data`.
fn update_look_behind(size: usize, old: &[u8], new_data: &[u8]) -> Vec<u8> {
    let delta = size.min(new_data.len());
    let mut out = Vec::with_capacity(size);
    if delta < old.len() {
        out.extend_from_slice(&old[old.len() - delta..]);
    }
    out.extend_from_slice(&new_data[new_data.len() - delta..]);
    out
}

impl BodyTransform for ReplacingTransform {
    fn update(&mut self, chunk: &[u8]) -> io::Result<Vec<u8>> {
        if self.max_search_len == 0 {
            return Ok(chunk.to_vec());
        }

        let mut buf = std::mem::take(&mut self.padding_buf);
        buf.extend_from_slice(chunk);

        let (new_data, last_match_end) = self.replace_all(&buf);

        let mut new_padding_len = new_data.len().min(self.padding_len);
        if let Some(end) = last_match_end {
            new_padding_len = new_padding_len.min(new_data.len() - end);
        }
        let ready_len = new_data.len() - new_padding_len;

        self.padding_buf = new_data[ready_len..].to_vec();
        let ready = new_data[..ready_len].to_vec();
        // a round that emits nothing must not clobber the window
        if !ready.is_empty() {
            self.look_behind_buf =
                update_look_behind(self.look_behind_size, &self.look_behind_buf, &ready);
        }
        Ok(ready)
    }

    fn finish(&mut self) -> io::Result<Vec<u8>> {
        if self.max_search_len == 0 {
            return Ok(Vec::new());
        }

        self.eof = true;
        let buf = std::mem::take(&mut self.padding_buf);
        let (new_data, _) = self.replace_all(&buf);
        Ok(new_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_literal(data: &[u8], search: &[u8], replace: &[u8], chunk_size: usize) -> Vec<u8> {
        let mut transform = ReplacingTransform::new_literal(search, replace);
        let mut out = Vec::new();
        for chunk in data.chunks(chunk_size.max(1)) {
            out.extend(transform.update(chunk).unwrap());
        }
        out.extend(transform.finish().unwrap());
        out
    }

    fn replace_all_reference(data: &[u8], search: &[u8], replace: &[u8]) -> Vec<u8> {
        if search.is_empty() {
            return data.to_vec();
        }
        let mut out = Vec::new();
        let mut rest = data;
        while let Some(idx) = find_subslice(rest, search) {
            out.extend_from_slice(&rest[..idx]);
            out.extend_from_slice(replace);
            rest = &rest[idx + search.len()..];
        }
        out.extend_from_slice(rest);
        out
    }

    #[test]
    fn test_basic_replacement() {
        assert_eq!(
            run_literal(b"123abc456abc789", b"abc", b"def", 4096),
            b"123def456def789"
        );
    }

    #[test]
    fn test_cross_boundary_replacement() {
        for chunk_size in 1..=6 {
            assert_eq!(
                run_literal(b"##abc##abc##", b"abc", b"def", chunk_size),
                b"##def##def##",
                "chunk size {chunk_size}"
            );
        }
    }

    #[test]
    fn test_empty_replace() {
        assert_eq!(run_literal(b"123abc456", b"abc", b"", 4096), b"123456");
    }

    #[test]
    fn test_no_match() {
        assert_eq!(run_literal(b"123456", b"xyz", b"def", 4096), b"123456");
    }

    #[test]
    fn test_empty_search_is_passthrough() {
        assert_eq!(run_literal(b"123456", b"", b"def", 2), b"123456");
    }

    #[test]
    fn test_replacement_not_rescanned() {
        // replacing "aa" -> "a" must not collapse recursively
        assert_eq!(run_literal(b"aaaa", b"aa", b"a", 4096), b"aa");
        for chunk_size in 1..=4 {
            assert_eq!(run_literal(b"aaaa", b"aa", b"a", chunk_size), b"aa");
        }
    }

    #[test]
    fn test_fuzzy_equivalence() {
        // deterministic pseudo-random corpus; every chunk size must produce
        // the same output as a whole-buffer replace
        let mut state: u64 = 0x243f6a8885a308d3;
        let mut next = move |bound: usize| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) as usize) % bound
        };

        for _ in 0..50 {
            let data_len = 1000 + next(3000);
            let mut data: Vec<u8> = (0..data_len).map(|_| b'a' + next(4) as u8).collect();

            let search_len = 1 + next(8);
            let search: Vec<u8> = (0..search_len).map(|_| b'a' + next(4) as u8).collect();
            let replace_len = next(10);
            let replace: Vec<u8> = (0..replace_len).map(|_| b'a' + next(4) as u8).collect();

            // splice in guaranteed occurrences
            for _ in 0..next(20) {
                let pos = next(data_len.saturating_sub(search_len).max(1));
                data[pos..pos + search_len].copy_from_slice(&search);
            }

            let expected = replace_all_reference(&data, &search, &replace);
            for chunk_size in [1, 2, 3, 5, 9, 17, 64, 4096] {
                assert_eq!(
                    run_literal(&data, &search, &replace, chunk_size),
                    expected,
                    "chunk size {chunk_size}, search {search:?}, replace {replace:?}"
                );
            }
        }
    }

    #[test]
    fn test_look_behind_reflects_emitted_stream() {
        // search fn that only replaces "b" when the previous emitted byte is 'x'
        let search_fn: SearchFn = Box::new(|buf, look_behind, _eof| {
            let mut start = 0;
            loop {
                let idx = find_subslice(&buf[start..], b"b")? + start;
                let prev = if idx == 0 {
                    look_behind.last().copied()
                } else {
                    Some(buf[idx - 1])
                };
                if prev == Some(b'x') {
                    return Some((idx, 1, b"B".to_vec()));
                }
                start = idx + 1;
            }
        });

        let mut transform = ReplacingTransform::new(search_fn, 1, 1);
        let mut out = Vec::new();
        for chunk in b"xb ab xb".chunks(1) {
            out.extend(transform.update(chunk).unwrap());
        }
        out.extend(transform.finish().unwrap());
        assert_eq!(out, b"xB ab xB");
    }
}
