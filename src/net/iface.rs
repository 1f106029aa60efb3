use std::net::IpAddr;

/// Resolve the first IPv4 address bound to a named network interface, for
/// binding servers to `net_interface_private` / `net_interface_public`
/// instead of the wildcard address. Returns `None` for an empty name or an
/// interface with no IPv4 address.
pub fn resolve_ipv4(iface_name: &str) -> Option<IpAddr> {
    if iface_name.is_empty() {
        return None;
    }
    pnet_datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == iface_name)
        .and_then(|iface| {
            iface
                .ips
                .into_iter()
                .find(|ip| ip.is_ipv4())
                .map(|ip| ip.ip())
        })
}
