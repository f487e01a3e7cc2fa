use anyhow::{bail, Context, Result};
use chrono::{FixedOffset, NaiveDateTime, TimeZone};
use clap::Parser;
use proto::{
    peek_request_id, Notification, Reader, Request, MAX_DATAGRAM, STATUS_SUCCESS,
};
use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing_subscriber::filter::LevelFilter;
use transport::{timed_out, Endpoint};

const RETRIES: u32 = 3;
const REPLY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Parser, Debug)]
#[command(name = "client", about = "Interactive facility booking client")]
struct Args {
    /// Server address
    #[arg(default_value = "127.0.0.1")]
    server_ip: String,

    /// Server UDP port
    #[arg(default_value_t = 8080)]
    server_port: u16,

    /// Probability in [0, 1] of simulating a lost request datagram
    #[arg(long, default_value_t = 0.0)]
    drop_rate: f64,

    /// UTC offset in hours used when entering and printing times
    #[arg(long, default_value_t = 8, allow_negative_numbers = true)]
    utc_offset: i32,
}

struct Client {
    socket: Endpoint,
    server: SocketAddr,
    next_request_id: u32,
    zone: FixedOffset,
}

impl Client {
    fn connect(args: &Args) -> Result<Self> {
        let server: SocketAddr = format!("{}:{}", args.server_ip, args.server_port)
            .parse()
            .context("invalid server address")?;
        let Some(zone) = FixedOffset::east_opt(args.utc_offset * 3600) else {
            bail!("utc offset {} is out of range", args.utc_offset);
        };

        let socket =
            Endpoint::bind("0.0.0.0:0".parse()?)?.with_drop_rate(args.drop_rate)?;

        Ok(Self {
            socket,
            server,
            next_request_id: 1,
            zone,
        })
    }

    /// Sends a request and waits for the matching response, retransmitting
    /// the identical datagram on timeout. Returns `None` when every attempt
    /// timed out. Notifications and stale responses arriving on the socket
    /// are skipped without restarting the attempt's timeout window.
    fn send_request(&mut self, request: &Request) -> Result<Option<Vec<u8>>> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let datagram = request.encode(request_id);

        for attempt in 1..=RETRIES {
            if !self.socket.send_lossy(&datagram, self.server)? {
                println!("[drop] request datagram lost (attempt {attempt}/{RETRIES})");
            }

            let deadline = Instant::now() + REPLY_TIMEOUT;
            if let Some(response) = self.recv_matching(request_id, deadline)? {
                return Ok(Some(response));
            }

            if attempt < RETRIES {
                println!("Timeout, retrying... (attempt {}/{})", attempt + 1, RETRIES);
            }
        }

        println!("Request timed out after {RETRIES} attempts");
        Ok(None)
    }

    fn recv_matching(&self, request_id: u32, deadline: Instant) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.socket.set_read_timeout(Some(remaining))?;

            match self.socket.recv(&mut buf) {
                Ok((n, from)) => {
                    if from == self.server && peek_request_id(&buf[..n]) == Some(request_id) {
                        return Ok(Some(buf[..n].to_vec()));
                    }
                }
                Err(ref err) if timed_out(err) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Prints push notifications for `duration` seconds after a successful
    /// monitor registration.
    fn listen_for_notifications(&self, duration: Duration) -> Result<()> {
        println!(
            "Listening for updates for {} seconds, Ctrl-C to abort...",
            duration.as_secs()
        );

        let deadline = Instant::now() + duration;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                println!("Monitoring interval elapsed");
                return Ok(());
            }
            self.socket.set_read_timeout(Some(remaining))?;

            let n = match self.socket.recv(&mut buf) {
                Ok((n, from)) if from == self.server => n,
                Ok(_) => continue,
                Err(ref err) if timed_out(err) => continue,
                Err(err) => return Err(err.into()),
            };

            if !Notification::matches(&buf[..n]) {
                continue;
            }
            match Notification::decode(&buf[..n]) {
                Ok(note) => self.print_notification(&note),
                Err(err) => println!("Received undecodable notification: {err}"),
            }
        }
    }

    fn print_notification(&self, note: &Notification) {
        println!("\n>>> {}", note.message);
        println!(
            "    booking {}: {} - {}",
            note.booking_id,
            self.format_time(note.new_start),
            self.format_time(note.new_end)
        );
        if note.op.carries_old_interval() {
            println!(
                "    previously: {} - {}",
                self.format_time(note.old_start),
                self.format_time(note.old_end)
            );
        }
        println!("    free slots over the next 7 days: {}", note.slots.len());
    }

    fn parse_time(&self, text: &str) -> Result<u32> {
        let naive = NaiveDateTime::parse_from_str(text.trim(), "%Y-%m-%d %H:%M")
            .context("expected YYYY-MM-DD HH:MM")?;
        let Some(local) = self.zone.from_local_datetime(&naive).single() else {
            bail!("time is not representable in the configured zone");
        };
        u32::try_from(local.timestamp()).context("time is out of the protocol's range")
    }

    fn format_time(&self, timestamp: u32) -> String {
        match self.zone.timestamp_opt(i64::from(timestamp), 0).single() {
            Some(dt) => dt.format("%Y-%m-%d %H:%M").to_string(),
            None => format!("@{timestamp}"),
        }
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Splits a response into its status and body, printing the server's
/// message on error. Returns `None` for error responses.
fn success_body<'a>(response: &'a [u8]) -> Option<Reader<'a>> {
    let mut r = Reader::new(response);
    let _request_id = r.get_u32().ok()?;
    let status = r.get_u8().ok()?;

    if status != STATUS_SUCCESS {
        match r.get_str() {
            Ok(message) => println!("Error: {message}"),
            Err(_) => println!("Error: malformed error response"),
        }
        return None;
    }

    Some(r)
}

fn query_availability(client: &mut Client) -> Result<()> {
    let facility = prompt("Facility name")?;
    let days_text = prompt("Day offsets, comma separated (0 = today)")?;
    let days = days_text
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.trim().parse::<u32>().context("day offsets must be numbers"))
        .collect::<Result<Vec<_>>>()?;

    let Some(response) = client.send_request(&Request::QueryAvailability { facility, days })?
    else {
        return Ok(());
    };
    let Some(mut body) = success_body(&response) else {
        return Ok(());
    };

    let count = body.get_u16()?;
    println!("{count} free slot(s):");
    for _ in 0..count {
        let start = body.get_u32()?;
        let end = body.get_u32()?;
        println!(
            "  {} - {}",
            client.format_time(start),
            client.format_time(end)
        );
    }
    Ok(())
}

fn book_facility(client: &mut Client) -> Result<()> {
    let facility = prompt("Facility name")?;
    let start = client.parse_time(&prompt("Start (YYYY-MM-DD HH:MM)")?)?;
    let end = client.parse_time(&prompt("End (YYYY-MM-DD HH:MM)")?)?;

    let Some(response) = client.send_request(&Request::Book {
        facility,
        start,
        end,
    })?
    else {
        return Ok(());
    };
    if let Some(mut body) = success_body(&response) {
        println!("Booked, confirmation id {}", body.get_u32()?);
    }
    Ok(())
}

fn change_booking(client: &mut Client) -> Result<()> {
    let booking_id = prompt("Booking id")?.parse()?;
    let offset_minutes = prompt("Offset in minutes (negative shifts earlier)")?.parse()?;

    let Some(response) = client.send_request(&Request::Change {
        booking_id,
        offset_minutes,
    })?
    else {
        return Ok(());
    };
    if let Some(mut body) = success_body(&response) {
        println!("{}", body.get_str()?);
    }
    Ok(())
}

fn monitor_facility(client: &mut Client) -> Result<()> {
    let facility = prompt("Facility name")?;
    let duration_secs: u32 = prompt("Monitor duration in seconds")?.parse()?;

    let Some(response) = client.send_request(&Request::Monitor {
        facility,
        duration_secs,
    })?
    else {
        return Ok(());
    };
    if let Some(mut body) = success_body(&response) {
        println!("{}", body.get_str()?);
        client.listen_for_notifications(Duration::from_secs(u64::from(duration_secs)))?;
    }
    Ok(())
}

fn last_booking_end(client: &mut Client) -> Result<()> {
    let facility = prompt("Facility name")?;

    let Some(response) = client.send_request(&Request::LastBookingEnd { facility })? else {
        return Ok(());
    };
    if let Some(mut body) = success_body(&response) {
        let last_end = body.get_u32()?;
        let message = body.get_str()?;
        if last_end == 0 {
            println!("{message}");
        } else {
            println!("{message}: {}", client.format_time(last_end));
        }
    }
    Ok(())
}

fn extend_booking(client: &mut Client) -> Result<()> {
    let booking_id = prompt("Booking id")?.parse()?;
    let minutes = prompt("Minutes to extend by")?.parse()?;

    let Some(response) = client.send_request(&Request::Extend {
        booking_id,
        minutes,
    })?
    else {
        return Ok(());
    };
    if let Some(mut body) = success_body(&response) {
        let new_end = body.get_u32()?;
        let message = body.get_str()?;
        println!("{message}, new end {}", client.format_time(new_end));
    }
    Ok(())
}

fn menu_loop(client: &mut Client) -> Result<()> {
    loop {
        println!();
        println!("==== Facility Booking ====");
        println!("1. Query availability");
        println!("2. Book a facility");
        println!("3. Change a booking");
        println!("4. Monitor a facility");
        println!("5. Last booking end time");
        println!("6. Extend a booking");
        println!("0. Quit");

        let choice = prompt("Choice")?;
        let result = match choice.as_str() {
            "1" => query_availability(client),
            "2" => book_facility(client),
            "3" => change_booking(client),
            "4" => monitor_facility(client),
            "5" => last_booking_end(client),
            "6" => extend_booking(client),
            "0" | "q" => return Ok(()),
            "" => continue,
            other => {
                println!("Unknown choice: {other}");
                continue;
            }
        };

        if let Err(err) = result {
            println!("Error: {err:#}");
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::WARN)
        .init();

    let args = Args::parse();
    let mut client = Client::connect(&args)?;

    println!("Connected to {}", client.server);
    if args.drop_rate > 0.0 {
        println!("Simulating request loss with probability {}", args.drop_rate);
    }

    menu_loop(&mut client)
}
