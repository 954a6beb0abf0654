//! Platform-specific lookups
//!
//! Best-effort process identification for the Process rule kind. On Linux
//! the /proc filesystem maps a connection's source endpoint to a socket
//! inode and then to the owning process name. Everywhere else the lookup
//! returns nothing and Process rules simply never match.

#[cfg(target_os = "linux")]
mod linux;

use std::net::SocketAddr;

/// Find the name of the local process owning a TCP connection from `src`
pub async fn find_process_name(src: SocketAddr) -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        linux::find_process_name(src).await
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = src;
        None
    }
}
