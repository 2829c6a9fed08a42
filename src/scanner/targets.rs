use std::{fmt, fs, net::Ipv4Addr, str::FromStr};

use eyre::eyre;

/// An inclusive range of IPv4 addresses, fed to the range scanner one
/// range at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Range {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl Ipv4Range {
    pub fn single(addr: Ipv4Addr) -> Self {
        Self {
            start: addr,
            end: addr,
        }
    }

    pub fn count(&self) -> usize {
        (u32::from(self.end) - u32::from(self.start) + 1) as usize
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        addr >= self.start && addr <= self.end
    }

    /// Splits into /24-aligned chunks. Each chunk is a unit of work for the
    /// range scanner, so big ranges scan in parallel.
    pub fn split_slash24(&self) -> Vec<Ipv4Range> {
        let mut chunks = Vec::new();
        let mut start = u32::from(self.start);
        let end = u32::from(self.end);
        loop {
            let chunk_end = (start | 0xFF).min(end);
            chunks.push(Ipv4Range {
                start: Ipv4Addr::from(start),
                end: Ipv4Addr::from(chunk_end),
            });
            if chunk_end == end {
                return chunks;
            }
            start = chunk_end + 1;
        }
    }
}

impl fmt::Display for Ipv4Range {
    /// Renders in the `start-end` form the range scanner accepts on the
    /// command line. Single addresses render bare.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

pub fn parse_file(path: &str) -> eyre::Result<Vec<Ipv4Range>> {
    let input = fs::read_to_string(path)?;

    parse(&input)
}

/// Parses a newline-separated target list. Each line is a bare address, a
/// `0.0.0.0/24` CIDR, or a `0.0.0.0-0.0.0.255` span; blank lines and `#`
/// comments are skipped.
pub fn parse(input: &str) -> eyre::Result<Vec<Ipv4Range>> {
    let mut ranges = Vec::new();

    for line in input.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // strip a trailing comment
        let line = line.split('#').next().unwrap_or(line).trim();

        ranges.push(parse_range(line)?);
    }

    ranges.sort_by_key(|range| range.start);

    Ok(ranges)
}

pub fn parse_range(line: &str) -> eyre::Result<Ipv4Range> {
    let is_slash = line.contains('/');
    let is_hyphen = line.contains('-');

    if is_slash && is_hyphen {
        return Err(eyre!(
            "Invalid target range: {line} (cannot contain both - and /)"
        ));
    }

    let range = if is_slash {
        let mut parts = line.split('/');

        let ip = parts.next().unwrap_or_default();
        let prefix = parts
            .next()
            .ok_or_else(|| eyre!("Invalid target range: {line}"))?;

        let prefix = prefix.parse::<u8>()?;
        if prefix > 32 {
            return Err(eyre!("Invalid target range: {line} (prefix > 32)"));
        }

        let host_bits = 32 - prefix;
        let mask_bits = if host_bits == 32 {
            u32::MAX
        } else {
            (1u32 << host_bits) - 1
        };

        let ip_u32 = u32::from(Ipv4Addr::from_str(ip)?);

        Ipv4Range {
            start: Ipv4Addr::from(ip_u32 & !mask_bits),
            end: Ipv4Addr::from(ip_u32 | mask_bits),
        }
    } else if is_hyphen {
        let mut parts = line.split('-');

        let start = Ipv4Addr::from_str(parts.next().unwrap_or_default())?;
        let end = Ipv4Addr::from_str(
            parts
                .next()
                .ok_or_else(|| eyre!("Invalid target range: {line}"))?,
        )?;

        if start > end {
            return Err(eyre!(
                "Invalid target range: {line} (start cannot be greater than end)"
            ));
        }

        Ipv4Range { start, end }
    } else {
        Ipv4Range::single(Ipv4Addr::from_str(line)?)
    };

    Ok(range)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_address() {
        let range = parse_range("192.168.1.5").unwrap();
        assert_eq!(range, Ipv4Range::single(Ipv4Addr::new(192, 168, 1, 5)));
        assert_eq!(range.count(), 1);
        assert_eq!(range.to_string(), "192.168.1.5");
    }

    #[test]
    fn parse_cidr() {
        let range = parse_range("10.0.0.77/24").unwrap();
        assert_eq!(range.start, Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(range.end, Ipv4Addr::new(10, 0, 0, 255));
        assert_eq!(range.count(), 256);
        assert_eq!(range.to_string(), "10.0.0.0-10.0.0.255");
    }

    #[test]
    fn parse_zero_prefix() {
        let range = parse_range("0.0.0.0/0").unwrap();
        assert_eq!(range.start, Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(range.end, Ipv4Addr::new(255, 255, 255, 255));
    }

    #[test]
    fn parse_span() {
        let range = parse_range("10.0.0.4-10.0.1.8").unwrap();
        assert_eq!(range.start, Ipv4Addr::new(10, 0, 0, 4));
        assert_eq!(range.end, Ipv4Addr::new(10, 0, 1, 8));
        assert!(range.contains(Ipv4Addr::new(10, 0, 0, 200)));
        assert!(!range.contains(Ipv4Addr::new(10, 0, 1, 9)));
    }

    #[test]
    fn slash24_splitting() {
        let range = parse_range("10.0.0.0/22").unwrap();
        let chunks = range.split_slash24();
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|chunk| chunk.count() == 256));
        assert_eq!(chunks[0].start, Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(chunks[3].end, Ipv4Addr::new(10, 0, 3, 255));

        // unaligned spans keep their ragged edges
        let ragged = parse_range("10.0.0.200-10.0.1.10").unwrap();
        let chunks = ragged.split_slash24();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].count(), 56);
        assert_eq!(chunks[1].count(), 11);

        let single = Ipv4Range::single(Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(single.split_slash24(), vec![single]);
    }

    #[test]
    fn rejects_mixed_and_reversed() {
        assert!(parse_range("10.0.0.0/24-10.0.1.0").is_err());
        assert!(parse_range("10.0.1.0-10.0.0.0").is_err());
        assert!(parse_range("10.0.0.0/33").is_err());
    }

    #[test]
    fn parse_list_with_comments() {
        let ranges = parse(
            "# targets\n\
             10.0.1.0/30\n\
             \n\
             192.168.0.1 # lab box\n\
             10.0.0.1-10.0.0.3\n",
        )
        .unwrap();
        assert_eq!(ranges.len(), 3);
        // sorted by start address
        assert_eq!(ranges[0].start, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(ranges[1].start, Ipv4Addr::new(10, 0, 1, 0));
        assert_eq!(ranges[2].start, Ipv4Addr::new(192, 168, 0, 1));
    }
}
