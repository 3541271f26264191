//! WiFi link maintenance and the blocking HTTP/JSON transport.
//!
//! The whole stack is driven from the main loop: `poll` keeps the WiFi
//! association and DHCP lease alive, `post_json` runs one POST exchange over
//! a raw TCP socket with bounded deadlines and watchdog feeds. Socket
//! buffers are statics guarded by a taken flag so a single exchange never
//! needs a large stack frame.

use core::fmt::Write as FmtWrite;
use core::sync::atomic::{AtomicBool, Ordering};
use esp_hal::delay::Delay;
use esp_radio::wifi::{ClientConfig, ModeConfig, WifiController, WifiDevice};
use heapless::String as HString;
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet, SocketStorage};
use smoltcp::socket::dhcpv4::{Event as DhcpEvent, Socket as DhcpSocket};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer, State as TcpState};
use smoltcp::time::Instant as SmoltcpInstant;
use smoltcp::wire::{EthernetAddress, HardwareAddress, IpAddress, IpCidr, Ipv4Address};

use crate::config::Config;

const CONNECT_TIMEOUT_MS: u64 = 5_000;
const RESPONSE_TIMEOUT_MS: u64 = 5_000;
const WDT_FEED_INTERVAL_MS: u64 = 2_000;

// WiFi connection constants
const WIFI_CONNECT_TIMEOUT_MS: u64 = 10_000;
const WIFI_MAX_RETRIES_BEFORE_RESET: u8 = 3;
const WIFI_RESET_COOLDOWN_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No WiFi association or no DHCP lease yet.
    NoLink,
    /// Server host is not a dotted-quad IPv4 address.
    BadHost,
    Connect,
    Timeout,
    Closed,
    Send,
    /// Response was not a well-formed HTTP 200.
    Http,
    /// Response body did not fit the caller's buffer.
    TooLarge,
}

// Static socket storage and I/O buffers with a taken flag; `post_json` is
// never re-entered, the flag turns a future mistake into a visible panic.
static BUFFERS_TAKEN: AtomicBool = AtomicBool::new(false);
static mut SOCKET_STORAGE: [SocketStorage<'static>; 4] = [SocketStorage::EMPTY; 4];
static mut RX_BUF: [u8; 4096] = [0; 4096];
static mut TX_BUF: [u8; 1024] = [0; 1024];

struct BufferGuard;

impl Drop for BufferGuard {
    fn drop(&mut self) {
        BUFFERS_TAKEN.store(false, Ordering::Release);
    }
}

fn take_buffers() -> (&'static mut [u8], &'static mut [u8], BufferGuard) {
    if BUFFERS_TAKEN.swap(true, Ordering::Acquire) {
        panic!("post_json called reentrantly");
    }
    // SAFETY: the taken flag grants exclusive access until the guard drops.
    unsafe { (&mut *core::ptr::addr_of_mut!(RX_BUF), &mut *core::ptr::addr_of_mut!(TX_BUF), BufferGuard) }
}

/// Parse an IPv4 address from a string without heap allocation.
fn parse_ipv4(s: &str) -> Option<Ipv4Address> {
    let mut octets = [0u8; 4];
    let mut idx = 0;

    for part in s.split('.') {
        if idx >= 4 {
            return None;
        }
        octets[idx] = part.parse().ok()?;
        idx += 1;
    }

    if idx == 4 {
        Some(Ipv4Address::new(octets[0], octets[1], octets[2], octets[3]))
    } else {
        None
    }
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_content_length(header: &[u8]) -> Option<usize> {
    let header_str = core::str::from_utf8(header).ok()?;
    for line in header_str.lines() {
        if line.len() >= 15 && line[..15].eq_ignore_ascii_case("content-length:") {
            return line[15..].trim().parse().ok();
        }
    }
    None
}

fn parse_status_code(header: &[u8]) -> Option<u16> {
    let header_str = core::str::from_utf8(header).ok()?;
    let status_line = header_str.lines().next()?;
    status_line.split_whitespace().nth(1)?.parse().ok()
}

/// WiFi association state machine with timeout-driven radio power cycling.
struct LinkState {
    connected: bool,
    connecting: bool,
    connect_started: u64,
    retry_count: u8,
    cooldown_until: u64,
}

impl LinkState {
    fn new() -> Self {
        Self {
            connected: false,
            connecting: false,
            connect_started: 0,
            retry_count: 0,
            cooldown_until: 0,
        }
    }

    fn maintain(
        &mut self,
        controller: &mut WifiController<'_>,
        config: &Config,
        now_ms: u64,
        ip_configured: &mut bool,
    ) {
        use alloc::string::ToString;

        let delay = Delay::new();

        if !self.connected {
            if now_ms < self.cooldown_until {
                // Radio reset cooldown, skip connection attempts
            } else if !self.connecting {
                log::info!("wifi: connecting to {}", config.ssid);

                // Stop before (re)configuring to avoid driver errors
                let _ = controller.stop();
                delay.delay_millis(10);

                let client_config = ClientConfig::default()
                    .with_ssid(config.ssid.to_string())
                    .with_password(config.password.to_string());
                if let Err(e) = controller.set_config(&ModeConfig::Client(client_config)) {
                    log::error!("wifi: set_config failed: {:?}", e);
                }
                if let Err(e) = controller.start() {
                    log::error!("wifi: start failed: {:?}", e);
                }
                if let Err(e) = controller.connect() {
                    log::error!("wifi: connect failed: {:?}", e);
                }
                self.connecting = true;
                self.connect_started = now_ms;
            } else if controller.is_connected().unwrap_or(false) {
                log::info!("wifi: connected");
                self.connected = true;
                self.connecting = false;
                self.retry_count = 0;
            } else if now_ms - self.connect_started > WIFI_CONNECT_TIMEOUT_MS {
                self.retry_count = self.retry_count.saturating_add(1);
                log::warn!(
                    "wifi: connection timeout (attempt {}/{})",
                    self.retry_count,
                    WIFI_MAX_RETRIES_BEFORE_RESET
                );

                if self.retry_count >= WIFI_MAX_RETRIES_BEFORE_RESET {
                    log::warn!("wifi: power-cycling radio after {} failures", self.retry_count);
                    let _ = controller.disconnect();
                    let _ = controller.stop();
                    crate::feed_watchdog();
                    delay.delay_millis(100);
                    self.retry_count = 0;
                    self.cooldown_until = now_ms + WIFI_RESET_COOLDOWN_MS;
                }
                self.connecting = false;
            }
        } else if !controller.is_connected().unwrap_or(false) {
            log::warn!("wifi: disconnected, will power-cycle radio");
            self.connected = false;
            self.connecting = false;
            *ip_configured = false;

            let _ = controller.disconnect();
            let _ = controller.stop();
            crate::feed_watchdog();
            delay.delay_millis(100);
            self.cooldown_until = now_ms + WIFI_RESET_COOLDOWN_MS;
        }
    }
}

/// Single-owner network stack: WiFi device, interface, DHCP and the one
/// client socket slot.
pub struct NetStack {
    device: WifiDevice<'static>,
    controller: WifiController<'static>,
    iface: Interface,
    sockets: SocketSet<'static>,
    dhcp_handle: SocketHandle,
    link: LinkState,
    ip_configured: bool,
    next_local_port: u16,
}

impl NetStack {
    pub fn new(mut device: WifiDevice<'static>, controller: WifiController<'static>) -> Self {
        let mac = esp_radio::wifi::sta_mac();
        let hw_addr = HardwareAddress::Ethernet(EthernetAddress(mac));
        let iface = Interface::new(IfaceConfig::new(hw_addr), &mut device, SmoltcpInstant::ZERO);

        // SAFETY: NetStack is constructed once at startup.
        let mut sockets = SocketSet::new(unsafe { &mut *core::ptr::addr_of_mut!(SOCKET_STORAGE) }.as_mut_slice());
        let dhcp_handle = sockets.add(DhcpSocket::new());

        Self {
            device,
            controller,
            iface,
            sockets,
            dhcp_handle,
            link: LinkState::new(),
            ip_configured: false,
            next_local_port: 49152,
        }
    }

    /// Keep the WiFi association, interface and DHCP lease alive. Called on
    /// every main-loop iteration.
    pub fn poll(&mut self, config: &Config, now_ms: u64) {
        self.link
            .maintain(&mut self.controller, config, now_ms, &mut self.ip_configured);
        if !self.link.connected {
            return;
        }

        let now = SmoltcpInstant::from_millis(now_ms as i64);
        self.iface.poll(now, &mut self.device, &mut self.sockets);

        let dhcp = self.sockets.get_mut::<DhcpSocket>(self.dhcp_handle);
        if let Some(event) = dhcp.poll() {
            match event {
                DhcpEvent::Configured(lease) => {
                    let addr = lease.address;
                    self.iface.update_ip_addrs(|addrs| {
                        addrs.clear();
                        addrs.push(IpCidr::Ipv4(addr)).ok();
                    });
                    if let Some(router) = lease.router {
                        self.iface.routes_mut().add_default_ipv4_route(router).ok();
                    }
                    log::info!("dhcp: IP={}", addr);
                    self.ip_configured = true;
                }
                DhcpEvent::Deconfigured => {
                    log::warn!("dhcp: deconfigured");
                    self.iface.update_ip_addrs(|addrs| addrs.clear());
                    self.ip_configured = false;
                }
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.link.connected && self.ip_configured
    }

    fn close_and_remove(&mut self, handle: SocketHandle) {
        let socket = self.sockets.get_mut::<TcpSocket>(handle);
        socket.close();
        self.sockets.remove(handle);
    }

    /// One blocking POST exchange. Returns the length of the response body
    /// copied into `response`; classification of the JSON happens upstream.
    pub fn post_json(
        &mut self,
        config: &Config,
        body: &[u8],
        response: &mut [u8],
    ) -> Result<usize, TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NoLink);
        }
        let remote_ip = parse_ipv4(config.server_host).ok_or(TransportError::BadHost)?;

        let delay = Delay::new();
        let (rx_buf, tx_buf, _guard) = take_buffers();
        let tcp_socket = TcpSocket::new(SocketBuffer::new(rx_buf), SocketBuffer::new(tx_buf));
        let handle = self.sockets.add(tcp_socket);

        // Rotate the local port so back-to-back stages don't collide with a
        // connection still in TIME_WAIT on the server side.
        let local_port = self.next_local_port;
        self.next_local_port = if local_port >= 64000 { 49152 } else { local_port + 1 };

        {
            let context = self.iface.context();
            let socket = self.sockets.get_mut::<TcpSocket>(handle);
            let remote = (IpAddress::Ipv4(remote_ip), config.server_port);
            if socket.connect(context, remote, local_port).is_err() {
                log::error!("net: connect initiation failed");
                self.close_and_remove(handle);
                return Err(TransportError::Connect);
            }
        }

        // Poll until the socket can send or the connect deadline passes
        let start = crate::now_ms();
        let mut last_feed = start;
        loop {
            let now = crate::now_ms();
            self.iface
                .poll(SmoltcpInstant::from_millis(now as i64), &mut self.device, &mut self.sockets);

            let socket = self.sockets.get_mut::<TcpSocket>(handle);
            if socket.may_send() {
                break;
            }
            if now - start > CONNECT_TIMEOUT_MS || socket.state() == TcpState::Closed {
                log::error!("net: connection timeout");
                self.close_and_remove(handle);
                return Err(TransportError::Timeout);
            }
            if now - last_feed >= WDT_FEED_INTERVAL_MS {
                last_feed = now;
                crate::feed_watchdog();
            }
            delay.delay_millis(10);
        }

        // Send header and body
        let mut header: HString<256> = HString::new();
        let _ = write!(
            header,
            "POST {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n",
            config.server_path,
            config.server_host,
            body.len(),
        );

        {
            let socket = self.sockets.get_mut::<TcpSocket>(handle);
            let sent = socket
                .send_slice(header.as_bytes())
                .and_then(|_| socket.send_slice(body));
            if sent.is_err() {
                log::error!("net: send failed");
                self.close_and_remove(handle);
                return Err(TransportError::Send);
            }
        }

        // Poll until the full response arrived or the deadline passes
        let mut received = 0usize;
        let start = crate::now_ms();
        let mut last_feed = start;
        let total = loop {
            let now = crate::now_ms();
            self.iface
                .poll(SmoltcpInstant::from_millis(now as i64), &mut self.device, &mut self.sockets);

            let socket = self.sockets.get_mut::<TcpSocket>(handle);
            if socket.may_recv() && received < response.len() {
                if let Ok(n) = socket.recv_slice(&mut response[received..]) {
                    received += n;
                }
            }

            if received > 0 {
                if received >= response.len() {
                    // Buffer filled without the full body arriving
                    let complete = find_header_end(&response[..received])
                        .and_then(|end| parse_content_length(&response[..end]).map(|len| end + 4 + len))
                        .map(|total| received >= total)
                        .unwrap_or(false);
                    if !complete {
                        self.close_and_remove(handle);
                        return Err(TransportError::TooLarge);
                    }
                }
                if let Some(header_end) = find_header_end(&response[..received]) {
                    if let Some(content_len) = parse_content_length(&response[..header_end]) {
                        if received >= header_end + 4 + content_len {
                            break received;
                        }
                    } else if matches!(socket.state(), TcpState::CloseWait | TcpState::Closed) {
                        break received; // server closed, we have what we'll get
                    }
                }
            }

            if now - start > RESPONSE_TIMEOUT_MS {
                log::error!("net: response timeout");
                self.close_and_remove(handle);
                return Err(TransportError::Timeout);
            }
            if socket.state() == TcpState::Closed && received == 0 {
                log::error!("net: connection closed unexpectedly");
                self.close_and_remove(handle);
                return Err(TransportError::Closed);
            }
            if now - last_feed >= WDT_FEED_INTERVAL_MS {
                last_feed = now;
                crate::feed_watchdog();
            }
            delay.delay_millis(10);
        };

        self.close_and_remove(handle);

        let header_end = find_header_end(&response[..total]).ok_or(TransportError::Http)?;
        if parse_status_code(&response[..header_end]) != Some(200) {
            return Err(TransportError::Http);
        }

        let body_start = header_end + 4;
        let body_len = parse_content_length(&response[..header_end])
            .unwrap_or(total - body_start)
            .min(total - body_start);
        response.copy_within(body_start..body_start + body_len, 0);
        Ok(body_len)
    }
}
