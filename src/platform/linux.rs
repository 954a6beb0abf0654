//! Linux process lookup via the /proc filesystem
//!
//! The source endpoint is matched against /proc/net/tcp[6] to find the
//! socket inode, then /proc/*/fd is scanned for the process holding it.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::fs;

pub async fn find_process_name(src: SocketAddr) -> Option<String> {
    let inode = find_socket_inode(src).await?;
    let pid = find_pid_by_inode(inode).await?;
    let comm = fs::read_to_string(format!("/proc/{}/comm", pid)).await.ok()?;
    let name = comm.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

async fn find_socket_inode(src: SocketAddr) -> Option<u64> {
    let table = if src.is_ipv4() {
        "/proc/net/tcp"
    } else {
        "/proc/net/tcp6"
    };
    let content = fs::read_to_string(table).await.ok()?;

    for line in content.lines().skip(1) {
        let mut fields = line.split_whitespace();
        fields.next()?; // slot index
        let local = fields.next()?;
        fields.next()?; // remote
        if parse_proc_addr(local)? != src {
            continue;
        }
        // st, tx_queue:rx_queue, tr:tm->when, retrnsmt, uid, timeout, inode
        return fields.nth(6).and_then(|s| s.parse().ok());
    }
    None
}

async fn find_pid_by_inode(inode: u64) -> Option<u32> {
    let needle = format!("socket:[{}]", inode);
    let mut proc_dir = fs::read_dir("/proc").await.ok()?;

    while let Ok(Some(entry)) = proc_dir.next_entry().await {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let fd_dir = format!("/proc/{}/fd", pid);
        let Ok(mut fds) = fs::read_dir(&fd_dir).await else {
            continue;
        };
        while let Ok(Some(fd)) = fds.next_entry().await {
            if let Ok(link) = fs::read_link(fd.path()).await {
                if link.to_string_lossy() == needle {
                    return Some(pid);
                }
            }
        }
    }
    None
}

/// Parse a `/proc/net/tcp` hex endpoint like `0100007F:1F90`
fn parse_proc_addr(s: &str) -> Option<SocketAddr> {
    let (addr_hex, port_hex) = s.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    let ip = match addr_hex.len() {
        8 => {
            let raw = u32::from_str_radix(addr_hex, 16).ok()?;
            // Little-endian in procfs
            IpAddr::V4(Ipv4Addr::from(raw.swap_bytes().to_be_bytes()))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
                let word = u32::from_str_radix(&addr_hex[i * 8..i * 8 + 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_le_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}
