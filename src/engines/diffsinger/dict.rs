//! Pronunciation dictionary loader.
//!
//! The dictionary file is UTF-8 text where each line maps a word to a
//! space-separated phoneme sequence:
//!
//! ```text
//! HELLO\tHH AH L OW
//! ```
//!
//! Both CR and LF are accepted as line separators. Lines without a TAB are
//! skipped. The whole file is read into one buffer and the separators are
//! rewritten to NUL in place, so phoneme lookups return string views into
//! that buffer with no per-entry allocation for the phoneme data.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use super::error::{DiffSingerError, Result};

/// Files above this size get their line count estimated up front so the map
/// can be sized in one allocation.
const LARGE_FILE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
struct Entry {
    offset: u32,
    count: u32,
}

/// A read-only word-to-phonemes dictionary.
///
/// Built once by [`PhonemeDict::load`], never mutated afterwards. The backing
/// buffer owns every phoneme string handed out by [`PhonemeList`].
#[derive(Debug)]
pub struct PhonemeDict {
    buf: Vec<u8>,
    map: HashMap<Box<str>, Entry>,
}

impl PhonemeDict {
    /// Load a pronunciation lexicon from `path`.
    pub fn load(path: &Path) -> Result<PhonemeDict> {
        let mut buf = fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DiffSingerError::FileNotFound(path.to_path_buf())
            } else {
                DiffSingerError::Io(e)
            }
        })?;
        let file_size = buf.len();
        buf.push(b'\n'); // terminating line break

        let mut map = HashMap::new();
        if file_size > LARGE_FILE_BYTES {
            let lines = buf.iter().filter(|&&b| b == b'\n').count() + 1;
            map.reserve(lines);
        }

        let len = buf.len();
        let mut i = 0;
        while i < len {
            while i < len && (buf[i] == b'\r' || buf[i] == b'\n') {
                buf[i] = 0;
                i += 1;
            }
            if i >= len {
                break;
            }
            let key_start = i;

            // Find the tab separating key and phonemes.
            let mut p = i;
            let mut tab_pos = None;
            while p < len {
                match buf[p] {
                    b'\t' => {
                        tab_pos = Some(p);
                        break;
                    }
                    b'\r' | b'\n' => break,
                    _ => p += 1,
                }
            }
            let Some(tab_pos) = tab_pos else {
                // Tab not found: the line produces no entry.
                while i < len && buf[i] != b'\r' && buf[i] != b'\n' {
                    buf[i] = 0;
                    i += 1;
                }
                continue;
            };
            buf[tab_pos] = 0;
            let value_start = tab_pos + 1;

            // Split phonemes at spaces until the line break.
            let mut count: u32 = 0;
            p = value_start;
            while p < len {
                match buf[p] {
                    b' ' => {
                        count += 1;
                        buf[p] = 0;
                    }
                    b'\r' | b'\n' => {
                        count += 1;
                        buf[p] = 0;
                        break;
                    }
                    _ => {}
                }
                p += 1;
            }

            let key = String::from_utf8_lossy(&buf[key_start..tab_pos]).into_owned();
            map.insert(
                key.into_boxed_str(),
                Entry {
                    offset: value_start as u32,
                    count,
                },
            );
            i = p + 1;
        }

        Ok(PhonemeDict { buf, map })
    }

    /// Look up `key`, returning its phoneme list if present.
    pub fn get(&self, key: &str) -> Option<PhonemeList<'_>> {
        self.map.get(key).map(|entry| self.list(entry))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Look up `key`, returning an empty phoneme list if absent.
    pub fn phonemes(&self, key: &str) -> PhonemeList<'_> {
        self.get(key).unwrap_or(PhonemeList {
            data: &[],
            count: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate over every entry in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, PhonemeList<'_>)> {
        self.map
            .iter()
            .map(|(key, entry)| (key.as_ref(), self.list(entry)))
    }

    fn list(&self, entry: &Entry) -> PhonemeList<'_> {
        PhonemeList {
            data: &self.buf[entry.offset as usize..],
            count: entry.count,
        }
    }
}

/// A sequence of NUL-terminated phoneme strings inside the dictionary buffer.
#[derive(Debug, Clone, Copy)]
pub struct PhonemeList<'a> {
    data: &'a [u8],
    count: u32,
}

impl<'a> PhonemeList<'a> {
    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> PhonemeIter<'a> {
        PhonemeIter {
            data: self.data,
            remaining: self.count,
        }
    }

    pub fn to_vec(&self) -> Vec<&'a str> {
        self.iter().collect()
    }
}

impl<'a> IntoIterator for PhonemeList<'a> {
    type Item = &'a str;
    type IntoIter = PhonemeIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct PhonemeIter<'a> {
    data: &'a [u8],
    remaining: u32,
}

impl<'a> Iterator for PhonemeIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.data.len());
        let phone = std::str::from_utf8(&self.data[..end]).unwrap_or("");
        // Step over the NUL terminator to the next phoneme.
        self.data = &self.data[(end + 1).min(self.data.len())..];
        Some(phone)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining as usize, Some(self.remaining as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::PhonemeDict;
    use std::fs;
    use std::path::PathBuf;

    fn write_dict(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("svs_dict_{}_{}", std::process::id(), name));
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn finds_entries_and_misses() {
        let path = write_dict("basic.txt", "key1\tval1 val2\nkey2\tval3 val4 val5\n");
        let dict = PhonemeDict::load(&path).unwrap();
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.get("key1").unwrap().to_vec(), vec!["val1", "val2"]);
        assert_eq!(
            dict.get("key2").unwrap().to_vec(),
            vec!["val3", "val4", "val5"]
        );
        assert!(dict.get("missing").is_none());
        assert!(!dict.contains("missing"));
        assert!(dict.phonemes("missing").is_empty());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn accepts_crlf_and_missing_final_newline() {
        let path = write_dict("crlf.txt", "a\tx y\r\nb\tz");
        let dict = PhonemeDict::load(&path).unwrap();
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.get("a").unwrap().to_vec(), vec!["x", "y"]);
        assert_eq!(dict.get("b").unwrap().to_vec(), vec!["z"]);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn skips_lines_without_tab() {
        let path = write_dict("notab.txt", "garbage line\nok\tph1 ph2\n\n");
        let dict = PhonemeDict::load(&path).unwrap();
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.get("ok").unwrap().to_vec(), vec!["ph1", "ph2"]);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn load_reports_missing_file() {
        let err = PhonemeDict::load(std::path::Path::new("/nonexistent/dict.txt")).unwrap_err();
        assert!(matches!(
            err,
            super::DiffSingerError::FileNotFound(_)
        ));
    }
}
