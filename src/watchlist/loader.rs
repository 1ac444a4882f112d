use std::path::Path;

use crate::config::{parse_address, RulesConfig};

use super::Watchlist;

/// Parse an address CSV.
/// Expected columns: address, label (optional). The first row is a header.
/// Unreadable records and invalid addresses are skipped with a warning.
pub fn parse_watchlist_csv(path: &Path) -> eyre::Result<Watchlist> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| eyre::eyre!("Failed to open address CSV '{}': {}", path.display(), e))?;

    let mut list = Watchlist::new();
    for (line, result) in reader.records().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    row = line + 2,
                    error = %e,
                    "Unreadable address CSV record, skipping"
                );
                continue;
            }
        };
        let raw = record.get(0).unwrap_or("");
        if raw.is_empty() {
            continue;
        }

        let address = match parse_address(raw) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    row = line + 2,
                    address = %raw,
                    error = %e,
                    "Invalid address in CSV, skipping"
                );
                continue;
            }
        };

        let label = record
            .get(1)
            .filter(|l| !l.is_empty())
            .map(str::to_string);
        list.insert(address, label);
    }

    tracing::info!(path = %path.display(), addresses = list.len(), "Loaded address CSV");
    Ok(list)
}

fn load_list(inline: &[String], path: Option<&str>) -> eyre::Result<Watchlist> {
    let mut list = match path {
        Some(path) => parse_watchlist_csv(Path::new(path))?,
        None => Watchlist::new(),
    };

    for raw in inline {
        list.insert(parse_address(raw)?, None);
    }

    Ok(list)
}

/// Suspicious addresses: inline config plus the optional CSV file.
pub fn load_watchlist(rules: &RulesConfig) -> eyre::Result<Watchlist> {
    load_list(
        &rules.suspicious_addresses,
        rules.suspicious_addresses_path.as_deref(),
    )
}

/// Whitelisted addresses: inline config plus the optional CSV file.
pub fn load_whitelist(rules: &RulesConfig) -> eyre::Result<Watchlist> {
    load_list(&rules.whitelist_addresses, rules.whitelist_path.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Address;
    use std::io::Write;

    fn write_csv(name: &str, body: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{}.csv", name, std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body).unwrap();
        path
    }

    #[test]
    fn test_parse_csv_skips_invalid_rows() {
        let path = write_csv(
            "watchlist-parse",
            b"address,label\n\
             0x1111111111111111111111111111111111111111,exploiter\n\
             not-an-address,junk\n\
             0x2222222222222222222222222222222222222222\n\
             ,\n",
        );

        let list = parse_watchlist_csv(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(list.len(), 2);
        assert_eq!(list.label(&Address::repeat_byte(0x11)), Some("exploiter"));
        assert_eq!(list.label(&Address::repeat_byte(0x22)), None);
        assert!(list.contains(&Address::repeat_byte(0x22)));
    }

    #[test]
    fn test_unreadable_record_does_not_abort_load() {
        // Invalid UTF-8 in the middle row fails record decoding.
        let mut body = b"address,label\n0x1111111111111111111111111111111111111111,a\n".to_vec();
        body.extend_from_slice(&[0xff, 0xfe, b',', 0xff, b'\n']);
        body.extend_from_slice(b"0x2222222222222222222222222222222222222222,b\n");
        let path = write_csv("watchlist-unreadable", &body);

        let list = parse_watchlist_csv(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(list.len(), 2);
        assert!(list.contains(&Address::repeat_byte(0x11)));
        assert!(list.contains(&Address::repeat_byte(0x22)));
    }

    #[test]
    fn test_load_merges_inline_addresses() {
        let path = write_csv(
            "watchlist-merge",
            b"address,label\n0x1111111111111111111111111111111111111111,exploiter\n",
        );
        let rules = RulesConfig {
            suspicious_addresses: vec!["0x3333333333333333333333333333333333333333".into()],
            suspicious_addresses_path: Some(path.display().to_string()),
            ..RulesConfig::default()
        };

        let list = load_watchlist(&rules).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(list.len(), 2);
        assert!(list.contains(&Address::repeat_byte(0x33)));
    }

    #[test]
    fn test_whitelist_loads_separately() {
        let path = write_csv(
            "whitelist-merge",
            b"address,label\n0x4444444444444444444444444444444444444444,treasury\n",
        );
        let rules = RulesConfig {
            suspicious_addresses: vec!["0x3333333333333333333333333333333333333333".into()],
            whitelist_addresses: vec!["0x5555555555555555555555555555555555555555".into()],
            whitelist_path: Some(path.display().to_string()),
            ..RulesConfig::default()
        };

        let whitelist = load_whitelist(&rules).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(whitelist.len(), 2);
        assert_eq!(whitelist.label(&Address::repeat_byte(0x44)), Some("treasury"));
        assert!(whitelist.contains(&Address::repeat_byte(0x55)));
        assert!(!whitelist.contains(&Address::repeat_byte(0x33)));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let rules = RulesConfig {
            suspicious_addresses_path: Some("/nonexistent/watchlist.csv".into()),
            ..RulesConfig::default()
        };
        assert!(load_watchlist(&rules).is_err());
    }
}
