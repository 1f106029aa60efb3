use std::io::BufRead;

const ARP_CACHE_PATH: &str = "/proc/net/arp";
const IP_FIELD: usize = 0;
const MAC_FIELD: usize = 3;
const IFACE_FIELD: usize = 5;
const MIN_FIELDS: usize = 6;

/// Best-effort MAC lookup from the kernel ARP cache. Returns `None` on any
/// I/O error, missing interface, or unresolved entry — the caller treats the
/// MAC as informational only, never part of `NodeKey` identity.
pub fn lookup_mac(ip: &str, iface: &str) -> Option<String> {
    let file = std::fs::File::open(ARP_CACHE_PATH).ok()?;
    let reader = std::io::BufReader::new(file);

    for line in reader.lines().map_while(Result::ok) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < MIN_FIELDS {
            continue;
        }
        if fields[IP_FIELD] == ip && fields[IFACE_FIELD] == iface {
            return Some(fields[MAC_FIELD].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cache_file_returns_none() {
        assert_eq!(lookup_mac("10.0.0.1", "eth-does-not-exist-anywhere"), None);
    }

    #[test]
    fn parses_well_formed_line() {
        let sample = "IP address       HW type     Flags       HW address            Mask     Device\n\
                       10.0.0.5         0x1         0x2         aa:bb:cc:dd:ee:ff     *        eth0\n";
        let mac = sample
            .lines()
            .skip(1)
            .find_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < MIN_FIELDS {
                    return None;
                }
                if fields[IP_FIELD] == "10.0.0.5" && fields[IFACE_FIELD] == "eth0" {
                    Some(fields[MAC_FIELD].to_string())
                } else {
                    None
                }
            });
        assert_eq!(mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
    }
}
