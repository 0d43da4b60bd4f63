//! Shell command builders for link, address, neighbor and route operations

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use cnci_common::shell;

/// Build bridge creation command
pub fn build_add_bridge_cmd(name: &str) -> String {
    format!(
        "{} link add {} type bridge",
        shell::IP_CMD,
        shell::shellquote(name)
    )
}

/// Build GRE tap creation command
///
/// The key places the subnet identifier in the GRE header so tunnels for
/// different subnets can share the same endpoint pair.
pub fn build_add_gretap_cmd(name: &str, local: Ipv4Addr, remote: Ipv4Addr, key: u32) -> String {
    format!(
        "{} link add {} type gretap local {} remote {} key {}",
        shell::IP_CMD,
        shell::shellquote(name),
        local,
        remote,
        key
    )
}

/// Build point-to-multipoint GRE tunnel creation command
///
/// No remote endpoint: neighbor entries on the device resolve the far side.
pub fn build_add_gretun_cmd(name: &str, local: Ipv4Addr, key: u32) -> String {
    format!(
        "{} link add {} type gre local {} key {}",
        shell::IP_CMD,
        shell::shellquote(name),
        local,
        key
    )
}

/// Build tap device creation command
pub fn build_add_tap_cmd(name: &str) -> String {
    format!(
        "{} tuntap add mode tap name {}",
        shell::IP_CMD,
        shell::shellquote(name)
    )
}

/// Build alias assignment command
pub fn build_set_alias_cmd(name: &str, alias: &str) -> String {
    format!(
        "{} link set dev {} alias {}",
        shell::IP_CMD,
        shell::shellquote(name),
        shell::shellquote(alias)
    )
}

/// Build link bring-up command
pub fn build_link_up_cmd(name: &str) -> String {
    format!(
        "{} link set dev {} up",
        shell::IP_CMD,
        shell::shellquote(name)
    )
}

/// Build attach-to-bridge command
pub fn build_set_master_cmd(name: &str, master: &str) -> String {
    format!(
        "{} link set dev {} master {}",
        shell::IP_CMD,
        shell::shellquote(name),
        shell::shellquote(master)
    )
}

/// Build link deletion command
pub fn build_link_del_cmd(name: &str) -> String {
    format!(
        "{} link del dev {}",
        shell::IP_CMD,
        shell::shellquote(name)
    )
}

/// Build link enumeration command (all links, JSON, with type details)
pub fn build_link_list_cmd() -> String {
    format!("{} -json -details link show", shell::IP_CMD)
}

/// Build single-link query command
pub fn build_link_show_cmd(name: &str) -> String {
    format!(
        "{} -json -details link show dev {}",
        shell::IP_CMD,
        shell::shellquote(name)
    )
}

/// Build address add command
pub fn build_addr_add_cmd(name: &str, addr: &Ipv4Net) -> String {
    format!(
        "{} addr add {} dev {}",
        shell::IP_CMD,
        addr,
        shell::shellquote(name)
    )
}

/// Build address delete command
pub fn build_addr_del_cmd(name: &str, addr: &Ipv4Net) -> String {
    format!(
        "{} addr del {} dev {}",
        shell::IP_CMD,
        addr,
        shell::shellquote(name)
    )
}

/// Build address list command (IPv4, JSON)
pub fn build_addr_list_cmd(name: &str) -> String {
    format!(
        "{} -json -4 addr show dev {}",
        shell::IP_CMD,
        shell::shellquote(name)
    )
}

/// Build permanent neighbor add command
///
/// On a GRE device the link-layer address is the IPv4 endpoint of the peer.
/// `replace` keeps repeated confirmation idempotent.
pub fn build_neigh_add_cmd(name: &str, dst: Ipv4Addr, lladdr: Ipv4Addr) -> String {
    format!(
        "{} neigh replace {} lladdr {} dev {} nud permanent",
        shell::IP_CMD,
        dst,
        lladdr,
        shell::shellquote(name)
    )
}

/// Build neighbor delete command
pub fn build_neigh_del_cmd(name: &str, dst: Ipv4Addr) -> String {
    format!(
        "{} neigh del {} dev {}",
        shell::IP_CMD,
        dst,
        shell::shellquote(name)
    )
}

/// Build neighbor list command (JSON)
pub fn build_neigh_list_cmd(name: &str) -> String {
    format!(
        "{} -json neigh show dev {}",
        shell::IP_CMD,
        shell::shellquote(name)
    )
}

/// Build device route add command (host routes towards the tunnel)
pub fn build_route_add_dev_cmd(dst: &Ipv4Net, dev: &str) -> String {
    format!(
        "{} route replace {} dev {}",
        shell::IP_CMD,
        dst,
        shell::shellquote(dev)
    )
}

/// Build gateway route add command (subnet routes via a peer tunnel IP)
pub fn build_route_add_via_cmd(dst: &Ipv4Net, via: Ipv4Addr) -> String {
    format!("{} route replace {} via {}", shell::IP_CMD, dst, via)
}

/// Build route delete command
pub fn build_route_del_cmd(dst: &Ipv4Net) -> String {
    format!("{} route del {}", shell::IP_CMD, dst)
}

/// Build route list command (IPv4, JSON)
pub fn build_route_list_cmd() -> String {
    format!("{} -json -4 route show", shell::IP_CMD)
}

/// Build IPv4 forwarding enable command
pub fn build_enable_forwarding_cmd() -> String {
    format!("{} -w net.ipv4.ip_forward=1", shell::SYSCTL_CMD)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_build_add_bridge_cmd() {
        let cmd = build_add_bridge_cmd("cncibr01");
        assert!(cmd.contains("ip link add"));
        assert!(cmd.contains("\"cncibr01\""));
        assert!(cmd.contains("type bridge"));
    }

    #[test]
    fn test_build_add_gretap_cmd() {
        let cmd = build_add_gretap_cmd("cncigt01", ip("10.0.0.1"), ip("10.0.0.5"), 42);
        assert!(cmd.contains("type gretap"));
        assert!(cmd.contains("local 10.0.0.1"));
        assert!(cmd.contains("remote 10.0.0.5"));
        assert!(cmd.contains("key 42"));
    }

    #[test]
    fn test_build_add_gretun_cmd() {
        let cmd = build_add_gretun_cmd("cncitun", ip("10.0.0.1"), 7);
        assert!(cmd.contains("type gre"));
        assert!(cmd.contains("local 10.0.0.1"));
        assert!(cmd.contains("key 7"));
        assert!(!cmd.contains("remote"));
    }

    #[test]
    fn test_build_set_alias_cmd() {
        let cmd = build_set_alias_cmd("cncibr01", "br_192.168.8.0+21");
        assert!(cmd.contains("alias \"br_192.168.8.0+21\""));
    }

    #[test]
    fn test_build_set_master_cmd() {
        let cmd = build_set_master_cmd("cncigt01", "cncibr01");
        assert!(cmd.contains("dev \"cncigt01\""));
        assert!(cmd.contains("master \"cncibr01\""));
    }

    #[test]
    fn test_build_neigh_add_cmd() {
        let cmd = build_neigh_add_cmd("cncitun", ip("192.168.0.2"), ip("10.0.0.7"));
        assert!(cmd.contains("neigh replace 192.168.0.2"));
        assert!(cmd.contains("lladdr 10.0.0.7"));
        assert!(cmd.contains("nud permanent"));
    }

    #[test]
    fn test_build_route_cmds() {
        let cmd = build_route_add_dev_cmd(&net("192.168.0.2/32"), "cncitun");
        assert!(cmd.contains("route replace 192.168.0.2/32"));
        assert!(cmd.contains("dev \"cncitun\""));

        let cmd = build_route_add_via_cmd(&net("172.16.0.0/24"), ip("192.168.0.2"));
        assert!(cmd.contains("route replace 172.16.0.0/24 via 192.168.0.2"));

        let cmd = build_route_del_cmd(&net("192.168.0.2/32"));
        assert!(cmd.contains("route del 192.168.0.2/32"));
    }

    #[test]
    fn test_build_enable_forwarding_cmd() {
        assert!(build_enable_forwarding_cmd().contains("net.ipv4.ip_forward=1"));
    }

    #[test]
    fn test_shellquote_safety() {
        let cmd = build_link_del_cmd("x; rm -rf /");
        assert!(cmd.contains("\"x; rm -rf /\""));
    }
}
