/*
sparseconv, to convert between raw and Android sparse images: size string module
Copyright (C) 2024-present Guoxin "7Ji" Pu

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as
published by the Free Software Foundation, either version 3 of the
License, or (at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

pub(crate) fn try_into_human_readble<N: Into<u64>>(original: N) -> (f64, char) {
    let mut number = original.into() as f64;
    const SUFFIXES: [char; 7] = ['B', 'K', 'M', 'G', 'T', 'P', 'E'];
    let mut suffix_id = 0;
    while number >= 1024.0 && suffix_id < SUFFIXES.len() - 1 {
        number /= 1024.0;
        suffix_id += 1;
    }
    (number, SUFFIXES[suffix_id])
}

/// Parse sizes like `64MB`, `1kb` or `4096`, base 1024.
///
/// Returns `None` if there is no valid number before the unit, or the result
/// overflows.
pub(crate) fn parse_size(value: &str) -> Option<u64> {
    const UNITS: [(&str, u64); 5] = [
        ("TB", 1 << 40),
        ("GB", 1 << 30),
        ("MB", 1 << 20),
        ("KB", 1 << 10),
        ("B", 1),
    ];
    let value = value.trim();
    let upper = value.to_ascii_uppercase();
    let (number, multiplier) = UNITS.iter()
        .find(|(suffix, _)| upper.ends_with(suffix))
        .map(|(suffix, multiplier)|
            (&value[..value.len() - suffix.len()], *multiplier))
        .unwrap_or((value, 1));
    number.parse::<u64>().ok()?.checked_mul(multiplier)
}

/// For clap's `value_parser`
pub(crate) fn parse_size_arg(value: &str) -> std::result::Result<u64, String> {
    parse_size(value).ok_or_else(||format!(
        "'{}' is not a size, expecting a number with optional B/KB/MB/GB/TB suffix",
        value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_units() {
        assert_eq!(parse_size("64MB"), Some(67108864));
        assert_eq!(parse_size("1KB"), Some(1024));
        assert_eq!(parse_size("0B"), Some(0));
        assert_eq!(parse_size("2GB"), Some(2 << 30));
        assert_eq!(parse_size("1TB"), Some(1 << 40));
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("512B"), Some(512));
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(parse_size("64mb"), Some(67108864));
        assert_eq!(parse_size("3Kb"), Some(3072));
    }

    #[test]
    fn parse_invalid() {
        assert_eq!(parse_size("MB"), None);
        assert_eq!(parse_size("B"), None);
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("-1MB"), None);
        assert_eq!(parse_size("1.5GB"), None);
        assert_eq!(parse_size("tenMB"), None);
        assert_eq!(parse_size("99999999999TB"), None);
        assert!(parse_size_arg("MB").is_err());
    }

    #[test]
    fn human_readable() {
        assert_eq!(try_into_human_readble(512u64), (512.0, 'B'));
        assert_eq!(try_into_human_readble(1536u64), (1.5, 'K'));
        assert_eq!(try_into_human_readble(64u64 << 20), (64.0, 'M'));
        assert_eq!(try_into_human_readble(u64::MAX).1, 'E');
    }
}
