//! Stand-ins for the sensor nodes and the logging back-end, with random fault
//! injection, so the pipeline can run without hardware.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use rand::Rng;

use crate::backend::{HttpBackend, HttpError, HttpResponse};
use crate::config::{SIMULATION_PRIORITY, SimulationConfig};
use crate::protocol::encode_frame;
use crate::state::apply_task_priority;
use crate::types::SensorKind;

const STALL_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub enum NodeBehaviour {
    /// Framed readings for one sensor, with `fault_percent` chance of a fault.
    Sensor { kind: SensorKind, fault_percent: u32 },
    /// Writes exactly this text.
    Fixed(String),
    /// Accepts and reads the command, never answers.
    Stall,
}

pub struct SimulatedNode {
    addr: SocketAddr,
    commands: Arc<Mutex<Vec<String>>>,
}

impl SimulatedNode {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Commands received so far, in arrival order.
    #[cfg(test)]
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Stall,
    Corrupt,
    Hangup,
}

fn reading(kind: SensorKind, row_id: i64) -> String {
    let mut rng = rand::thread_rng();
    let (v1, v2): (f32, f32) = match kind {
        SensorKind::Bme280 | SensorKind::Sht => (rng.gen_range(18.0..26.0), rng.gen_range(30.0..60.0)),
        SensorKind::Bmp280 | SensorKind::Bmp390 => (rng.gen_range(980.0..1030.0), rng.gen_range(18.0..26.0)),
        SensorKind::Ds1 => (rng.gen_range(-5.0..30.0), 0.0),
        SensorKind::Adc => (rng.gen_range(0.0..3.3), 0.0),
    };
    format!("{},{:.1},{:.1},0,{}", kind as i32, v1, v2, row_id)
}

fn pick_fault(fault_percent: u32) -> Option<Fault> {
    let mut rng = rand::thread_rng();
    if rng.gen_range(0..100) >= fault_percent {
        return None;
    }
    match rng.gen_range(0..3) {
        0 => Some(Fault::Stall),
        1 => Some(Fault::Corrupt),
        _ => Some(Fault::Hangup),
    }
}

fn serve(mut stream: TcpStream, behaviour: &NodeBehaviour, row_id: i64, commands: &Mutex<Vec<String>>) -> io::Result<()> {
    let mut line = String::new();
    BufReader::new(stream.try_clone()?).read_line(&mut line)?;
    commands
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(line.trim().to_string());

    let response = match behaviour {
        NodeBehaviour::Fixed(text) => text.clone(),
        NodeBehaviour::Stall => {
            thread::sleep(Duration::from_millis(STALL_MS));
            return Ok(());
        }
        NodeBehaviour::Sensor { kind, fault_percent } => {
            let framed = encode_frame(&reading(*kind, row_id));
            match pick_fault(*fault_percent) {
                None => framed,
                Some(Fault::Stall) => {
                    thread::sleep(Duration::from_millis(STALL_MS));
                    return Ok(());
                }
                Some(Fault::Hangup) => return Ok(()),
                Some(Fault::Corrupt) => framed.replacen(',', ";", 1),
            }
        }
    };

    stream.write_all(response.as_bytes())?;
    stream.flush()
}

/// Binds a node and serves it on a background thread, one request per connection.
pub fn spawn_node(bind: SocketAddr, behaviour: NodeBehaviour) -> io::Result<SimulatedNode> {
    let listener = TcpListener::bind(bind)?;
    let addr = listener.local_addr()?;
    let commands = Arc::new(Mutex::new(Vec::new()));

    let served = Arc::clone(&commands);
    thread::Builder::new().name(format!("node_{}", addr)).spawn(move || {
        let _ = apply_task_priority(SIMULATION_PRIORITY);
        let mut row_id = 0i64;

        for stream in listener.incoming().flatten() {
            row_id += 1;
            let behaviour = behaviour.clone();
            let served = Arc::clone(&served);
            thread::spawn(move || {
                let _ = serve(stream, &behaviour, row_id, &served);
            });
        }
    })?;

    Ok(SimulatedNode { addr, commands })
}

/// In-process logging back-end serving discovery, row count, POST and deletes.
pub struct SimulatedBackend {
    nodes: Vec<(String, SensorKind, Ipv4Addr)>,
    fault_percent: u32,
    rows: AtomicI64,
}

impl SimulatedBackend {
    pub fn new(nodes: Vec<(String, SensorKind, Ipv4Addr)>, fault_percent: u32) -> Self {
        Self { nodes, fault_percent, rows: AtomicI64::new(0) }
    }

    fn listing(&self) -> String {
        let mut body = format!("{}|", self.nodes.len());
        for (name, kind, addr) in &self.nodes {
            body.push_str(&format!("{},{}:{}|", name, kind.name(), addr));
        }
        body
    }

    fn flaky(&self) -> bool {
        rand::thread_rng().gen_range(0..100) < self.fault_percent
    }
}

impl HttpBackend for SimulatedBackend {
    fn get(&self, url: &str) -> Result<HttpResponse, HttpError> {
        if self.flaky() {
            return Err(HttpError::Transport("simulated timeout".to_string()));
        }

        let body = if url.ends_with("/ip.php") {
            self.listing()
        } else if url.ends_with("/rows.php") {
            self.rows.load(Ordering::Relaxed).to_string()
        } else if url.contains("/delete.php?key=") {
            self.rows.fetch_sub(1, Ordering::Relaxed);
            "1".to_string()
        } else {
            String::new()
        };

        Ok(HttpResponse { status: 200, body })
    }

    fn post_form(&self, _url: &str, form: &str) -> Result<HttpResponse, HttpError> {
        if self.flaky() || !form.starts_with("api_key=") {
            return Err(HttpError::Transport("simulated reset".to_string()));
        }

        let id = self.rows.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(HttpResponse { status: 201, body: format!("{}|ok", id) })
    }
}

/// Starts `config.nodes` loopback nodes (`127.0.0.2`, `127.0.0.3`, ...) on the
/// gateway's node port and returns a back-end that lists them.
pub fn start(config: &SimulationConfig, node_port: u16) -> io::Result<(Vec<SimulatedNode>, SimulatedBackend)> {
    const KINDS: [SensorKind; 4] = [SensorKind::Bme280, SensorKind::Bmp390, SensorKind::Sht, SensorKind::Ds1];

    let mut nodes = Vec::new();
    let mut listing = Vec::new();

    for i in 0..config.nodes {
        let addr = Ipv4Addr::new(127, 0, 0, i.saturating_add(2));
        let kind = KINDS[i as usize % KINDS.len()];
        let behaviour = NodeBehaviour::Sensor { kind, fault_percent: config.fault_percent };

        nodes.push(spawn_node(SocketAddr::from((addr, node_port)), behaviour)?);
        listing.push((format!("ROOM{}", i + 1), kind, addr));
    }

    Ok((nodes, SimulatedBackend::new(listing, config.fault_percent)))
}
