//! Raw NDJSON peer that writes its lines one at a time with a pause between
//! them, for tests that watch fragments arrive while the response is open.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

pub(crate) struct PacedPeer {
    addr: SocketAddr,
}

impl PacedPeer {
    /// Answer the first request with `lines`, flushing each and sleeping `gap` after it.
    pub(crate) fn serve(lines: Vec<String>, gap: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        std::thread::spawn(move || {
            let Ok((mut socket, _)) = listener.accept() else {
                return;
            };
            if read_request(&socket).is_some() {
                let _ = write_paced(&mut socket, &lines, gap);
            }
        });

        Self { addr }
    }

    /// A base URL nothing listens on.
    pub(crate) fn unused_base_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    pub(crate) fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Consume headers and body so the client sees its request fully read.
fn read_request(socket: &TcpStream) -> Option<()> {
    let mut reader = BufReader::new(socket.try_clone().ok()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).ok()?;

    let mut content_length = 0;
    loop {
        let mut header = String::new();
        reader.read_line(&mut header).ok()?;
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':')
            && name.eq_ignore_ascii_case("content-length")
        {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }

    let mut body = vec![0; content_length];
    reader.read_exact(&mut body).ok()
}

fn write_paced(socket: &mut TcpStream, lines: &[String], gap: Duration) -> std::io::Result<()> {
    write!(
        socket,
        "HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nConnection: close\r\n\r\n"
    )?;
    socket.flush()?;
    for line in lines {
        writeln!(socket, "{line}")?;
        socket.flush()?;
        std::thread::sleep(gap);
    }
    socket.shutdown(std::net::Shutdown::Both)
}
