//! Kernel-level TCP statistics (RTT, retransmits) via `TCP_INFO`.
//!
//! RTT is taken from the transport layer's own estimate rather than
//! application-level probing. Platforms without `TCP_INFO` report the
//! metrics as absent.

/// Raw socket handle used to query kernel statistics while the owning
/// stream lives in a worker task.
#[cfg(unix)]
pub type SocketHandle = std::os::unix::io::RawFd;
#[cfg(not(unix))]
pub type SocketHandle = i32;

/// Point-in-time TCP statistics for one connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpSnapshot {
    /// Smoothed round-trip time in microseconds, if the kernel exposes it
    pub rtt_us: Option<u64>,
    /// RTT variance in microseconds
    pub rtt_var_us: Option<u64>,
    /// Cumulative retransmitted segments
    pub retransmits: u64,
    /// Send congestion window in segments
    pub snd_cwnd: Option<u64>,
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{SocketHandle, TcpSnapshot};
    use std::mem;

    // Leading fields of the kernel's struct tcp_info; the kernel copies at
    // most `len` bytes so trailing fields may be omitted.
    #[repr(C)]
    #[derive(Default, Clone, Copy)]
    struct TcpInfo {
        tcpi_state: u8,
        tcpi_ca_state: u8,
        tcpi_retransmits: u8,
        tcpi_probes: u8,
        tcpi_backoff: u8,
        tcpi_options: u8,
        tcpi_snd_wscale_rcv_wscale: u8,
        tcpi_delivery_rate_app_limited: u8,

        tcpi_rto: u32,
        tcpi_ato: u32,
        tcpi_snd_mss: u32,
        tcpi_rcv_mss: u32,

        tcpi_unacked: u32,
        tcpi_sacked: u32,
        tcpi_lost: u32,
        tcpi_retrans: u32,
        tcpi_fackets: u32,

        tcpi_last_data_sent: u32,
        tcpi_last_ack_sent: u32,
        tcpi_last_data_recv: u32,
        tcpi_last_ack_recv: u32,

        tcpi_pmtu: u32,
        tcpi_rcv_ssthresh: u32,
        tcpi_rtt: u32,
        tcpi_rttvar: u32,
        tcpi_snd_ssthresh: u32,
        tcpi_snd_cwnd: u32,
        tcpi_advmss: u32,
        tcpi_reordering: u32,

        tcpi_rcv_rtt: u32,
        tcpi_rcv_space: u32,

        tcpi_total_retrans: u32,
    }

    pub fn snapshot(fd: SocketHandle) -> std::io::Result<TcpSnapshot> {
        let mut info = TcpInfo::default();
        let mut len = mem::size_of::<TcpInfo>() as libc::socklen_t;

        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                &mut info as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };

        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }

        Ok(TcpSnapshot {
            rtt_us: if info.tcpi_rtt > 0 {
                Some(info.tcpi_rtt as u64)
            } else {
                None
            },
            rtt_var_us: Some(info.tcpi_rttvar as u64),
            retransmits: info.tcpi_total_retrans as u64,
            snd_cwnd: Some(info.tcpi_snd_cwnd as u64),
        })
    }
}

#[cfg(not(target_os = "linux"))]
mod fallback {
    use super::{SocketHandle, TcpSnapshot};

    pub fn snapshot(_fd: SocketHandle) -> std::io::Result<TcpSnapshot> {
        Ok(TcpSnapshot::default())
    }
}

#[cfg(target_os = "linux")]
pub use linux::snapshot;

#[cfg(not(target_os = "linux"))]
pub use fallback::snapshot;

/// RTT estimate in microseconds for one connection, `None` when the
/// platform or socket state does not provide one.
pub fn rtt_us(fd: SocketHandle) -> Option<u64> {
    snapshot(fd).ok().and_then(|s| s.rtt_us)
}

/// Mean RTT estimate in microseconds over a session's data connections,
/// `None` when no connection reports one.
pub fn mean_rtt_us(handles: &[SocketHandle]) -> Option<f64> {
    let mut sum = 0u64;
    let mut count = 0u64;
    for &fd in handles {
        if let Some(rtt) = rtt_us(fd) {
            sum += rtt;
            count += 1;
        }
    }
    if count > 0 {
        Some(sum as f64 / count as f64)
    } else {
        None
    }
}
