//! Wildcard byte-pattern search over the main module.

use xcall_core::{Va, XcallCore, XcallDriver, XcallError};

/// Number of bytes read from the target at once.
const CHUNK_SIZE: u64 = 0x10000;

/// A byte pattern with wildcards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pattern: Vec<u8>,
    mask: Vec<bool>,

    /// Index of the first non-wildcard byte; candidates are found by
    /// searching for it.
    anchor: usize,
}

impl Signature {
    /// Creates a signature from a pattern and a mask.
    ///
    /// Each mask character corresponds to a pattern byte: `x` must match,
    /// `?` matches any byte. The pattern must contain at least one `x`.
    pub fn new(pattern: &[u8], mask: &str) -> Result<Self, XcallError> {
        if pattern.len() != mask.len() {
            return Err(XcallError::InvalidPattern);
        }

        let mask = mask
            .chars()
            .map(|c| match c {
                'x' | 'X' => Ok(true),
                '?' => Ok(false),
                _ => Err(XcallError::InvalidPattern),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::from_parts(pattern.to_vec(), mask)
    }

    /// Parses an IDA-style pattern such as `"48 8B ?? 05"`.
    ///
    /// Wildcards are written as `?` or `??`.
    pub fn parse(text: &str) -> Result<Self, XcallError> {
        let mut pattern = Vec::new();
        let mut mask = Vec::new();

        for token in text.split_whitespace() {
            match token {
                "?" | "??" => {
                    pattern.push(0);
                    mask.push(false);
                }
                _ => {
                    let byte =
                        u8::from_str_radix(token, 16).map_err(|_| XcallError::InvalidPattern)?;

                    pattern.push(byte);
                    mask.push(true);
                }
            }
        }

        Self::from_parts(pattern, mask)
    }

    fn from_parts(pattern: Vec<u8>, mask: Vec<bool>) -> Result<Self, XcallError> {
        let anchor = mask
            .iter()
            .position(|&exact| exact)
            .ok_or(XcallError::InvalidPattern)?;

        Ok(Self {
            pattern,
            mask,
            anchor,
        })
    }

    /// Returns the length of the signature in bytes.
    pub fn len(&self) -> usize {
        self.pattern.len()
    }

    /// Always `false`; a signature has at least one exact byte.
    pub fn is_empty(&self) -> bool {
        self.pattern.is_empty()
    }

    /// Checks whether the signature matches at the start of `data`.
    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() >= self.pattern.len()
            && self
                .pattern
                .iter()
                .zip(&self.mask)
                .zip(data)
                .all(|((expected, exact), actual)| !exact || expected == actual)
    }

    /// Returns the offset of the first match in `haystack`.
    pub fn find(&self, haystack: &[u8]) -> Option<usize> {
        if haystack.len() < self.pattern.len() {
            return None;
        }

        let last = haystack.len() - self.pattern.len();
        let anchored = &haystack[self.anchor..=last + self.anchor];

        memchr::memchr_iter(self.pattern[self.anchor], anchored)
            .find(|&offset| self.matches(&haystack[offset..]))
    }
}

/// Searches the main module for a signature.
///
/// The search covers `[start, end of module)`, where `start` defaults to the
/// module base. If an explicit start finds nothing, the search wraps around
/// to `[base, start)`.
pub fn scan_signature<Driver>(
    core: &XcallCore<Driver>,
    signature: &Signature,
    start: Option<Va>,
) -> Result<Option<Va>, XcallError>
where
    Driver: XcallDriver,
{
    let module = core.main_module();
    let base = module.base;
    let end = module.end();

    let start = match start {
        Some(start) if !start.is_null() && module.contains(start) => start,
        _ => base,
    };

    if let Some(address) = scan_range(core, signature, start, end)? {
        tracing::debug!(%address, "signature found");
        return Ok(Some(address));
    }

    if start != base {
        // Matches may straddle the original start.
        let wrap_end = Va((start.0 + signature.len() as u64 - 1).min(end.0));

        if let Some(address) = scan_range(core, signature, base, wrap_end)? {
            tracing::debug!(%address, "signature found after wrap-around");
            return Ok(Some(address));
        }
    }

    tracing::debug!(%start, "signature not found");
    Ok(None)
}

fn scan_range<Driver>(
    core: &XcallCore<Driver>,
    signature: &Signature,
    start: Va,
    end: Va,
) -> Result<Option<Va>, XcallError>
where
    Driver: XcallDriver,
{
    let overlap = signature.len() as u64 - 1;
    let mut address = start;

    while address < end {
        let size = (end - address).min(CHUNK_SIZE + overlap);
        let chunk = core.read_bytes(address, size as usize)?;

        if let Some(offset) = signature.find(&chunk) {
            return Ok(Some(address + offset as u64));
        }

        if size <= overlap {
            break;
        }

        address += size - overlap;
    }

    Ok(None)
}
