//! Step index scanner.
//!
//! A `.idxE` file holds one line per acquisition step:
//! `<param1> <param2> <first byte> <end byte>`, the byte range being a
//! half-open slice of the matching `.rawE` file.

use crate::writer::index_path;
use crate::{Error, Result};
use std::fs;
use std::path::Path;

/// One acquisition step of a raw file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    /// First step parameter.
    pub param1: f32,
    /// Second step parameter.
    pub param2: f32,
    /// Offset of the first byte of the step (inclusive).
    pub begin: u64,
    /// Offset past the last byte of the step (exclusive).
    pub end: u64,
}

impl Step {
    /// Size of the step in bytes.
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    /// Formats the step as an index line, without the newline.
    #[must_use]
    pub fn to_index_line(&self) -> String {
        format!("{} {} {} {}", self.param1, self.param2, self.begin, self.end)
    }

    fn parse(line: &str, number: usize) -> Result<Self> {
        let invalid = || Error::InvalidIndex {
            line: number,
            content: line.to_string(),
        };
        let mut fields = line.split_whitespace();
        let mut next = || fields.next().ok_or_else(invalid);
        let param1 = next()?.parse().map_err(|_| invalid())?;
        let param2 = next()?.parse().map_err(|_| invalid())?;
        let begin = next()?.parse().map_err(|_| invalid())?;
        let end = next()?.parse().map_err(|_| invalid())?;
        if fields.next().is_some() || end < begin {
            return Err(invalid());
        }
        Ok(Self {
            param1,
            param2,
            begin,
            end,
        })
    }
}

/// The steps listed in a step index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawScanner {
    steps: Vec<Step>,
}

impl RawScanner {
    /// Reads `<prefix>.idxE`.
    ///
    /// # Errors
    /// Returns [`Error::Open`] if the index cannot be read and
    /// [`Error::InvalidIndex`] for a malformed line.
    pub fn open<P: AsRef<Path>>(prefix: P) -> Result<Self> {
        let path = index_path(prefix);
        let text = fs::read_to_string(&path).map_err(|source| Error::Open {
            path: path.clone(),
            source,
        })?;
        let scanner = Self::parse(&text)?;
        log::debug!("{}: {} steps", path.display(), scanner.n_steps());
        Ok(scanner)
    }

    /// Parses index text. Blank lines are ignored.
    ///
    /// # Errors
    /// Returns [`Error::InvalidIndex`] for a malformed line.
    pub fn parse(text: &str) -> Result<Self> {
        let steps = text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| Step::parse(line, i + 1))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { steps })
    }

    /// Number of steps.
    #[must_use]
    pub fn n_steps(&self) -> usize {
        self.steps.len()
    }

    /// Step `index`, if present.
    #[must_use]
    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    /// All steps in file order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_parse_index() {
        let scanner = RawScanner::parse("0 0 9 1009\n1.5 -2 1009 1500\n\n").unwrap();
        assert_eq!(scanner.n_steps(), 2);
        let second = scanner.step(1).unwrap();
        assert_relative_eq!(second.param1, 1.5);
        assert_relative_eq!(second.param2, -2.0);
        assert_eq!((second.begin, second.end), (1009, 1500));
        assert_eq!(second.byte_len(), 491);
        assert!(scanner.step(2).is_none());
    }

    #[test]
    fn test_index_line_round_trip() {
        let step = Step {
            param1: 0.25,
            param2: 3.0,
            begin: 9,
            end: 77,
        };
        let scanner = RawScanner::parse(&step.to_index_line()).unwrap();
        assert_eq!(scanner.steps(), &[step]);
    }

    #[test]
    fn test_malformed_lines() {
        for bad in ["0 0 9", "0 0 9 x", "0 0 20 10", "0 0 1 2 3"] {
            let err = RawScanner::parse(bad).unwrap_err();
            assert!(matches!(err, Error::InvalidIndex { line: 1, .. }), "{bad}");
        }
    }

    #[test]
    fn test_missing_index_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = RawScanner::open(dir.path().join("absent")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(2));
    }
}
