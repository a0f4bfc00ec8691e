//! RFID Read Simulation
//!
//! Generates synthetic reader traffic for one facility for testing
//! rfid-inventory. Simulates:
//! - Floor sensors cycle-counting tagged stock with noisy RSSI
//! - Items walking out through the exit portal
//! - Items sold at the point of sale
//! - Periodic handheld cycle counts
//! - New stock arriving
//!
//! # Usage
//! ```bash
//! ./read-simulation --print-config > inventory_config.toml
//! ./read-simulation --batches 500 --interval-ms 20 | ./rfid-inventory --stdin
//! ```

use clap::Parser;
use rand::prelude::*;
use rand_distr::{Distribution, Normal};
use std::io::{self, Write};
use std::time::Duration;

use rfid_inventory::config::{FacilityConfig, InventoryConfig};
use rfid_inventory::types::{now_millis, ReadBatch, RfidSensor, SensorPersonality, TagRead};

// ============================================================================
// Site Constants
// ============================================================================

const FLOOR_SENSORS: [&str; 4] = ["floor-01", "floor-02", "floor-03", "floor-04"];
const EXIT_SENSOR: &str = "exit-01";
const POS_SENSOR: &str = "pos-01";
const HANDHELD: &str = "handheld-01";
/// Mean RSSI of a floor read (dBm)
const FLOOR_RSSI_MEAN: f64 = -62.0;
/// Mean RSSI at the exit portal (dBm)
const PORTAL_RSSI_MEAN: f64 = -48.0;
/// Simulated milliseconds between batches
const TICK_MS: i64 = 2_000;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "read-simulation")]
#[command(about = "Synthetic RFID read traffic for rfid-inventory testing")]
#[command(version = "1.0")]
struct Args {
    /// Number of batches to emit
    #[arg(short, long, default_value = "200")]
    batches: u32,

    /// Tags on the floor at the start
    #[arg(short, long, default_value = "100", value_parser = clap::value_parser!(u32).range(1..=100_000))]
    tags: u32,

    /// Facility id stamped on every read
    #[arg(long, default_value = "STORE_001")]
    facility: String,

    /// Wall-clock delay between emitted batches (0 = as fast as possible)
    #[arg(long, default_value = "0")]
    interval_ms: u64,

    /// Fraction of floor tags read per batch
    #[arg(long, default_value = "0.3")]
    read_fraction: f64,

    /// Emit a handheld cycle count every N batches (0 = never)
    #[arg(long, default_value = "50")]
    handheld_every: u32,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Print a matching inventory_config.toml and exit
    #[arg(long)]
    print_config: bool,

    /// Suppress the progress log on stderr
    #[arg(short, long)]
    quiet: bool,
}

// ============================================================================
// Simulated Stock
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Fate {
    OnFloor,
    /// Walking out; number of portal reads left to emit
    Leaving(u8),
    Gone,
}

struct SimTag {
    epc: String,
    fate: Fate,
}

struct Simulator {
    rng: StdRng,
    floor_noise: Normal<f64>,
    portal_noise: Normal<f64>,
    tags: Vec<SimTag>,
    next_serial: u64,
    clock: i64,
    facility: String,
}

impl Simulator {
    fn new(args: &Args) -> io::Result<Self> {
        let rng = match args.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let mut sim = Self {
            rng,
            floor_noise: Normal::new(FLOOR_RSSI_MEAN, 8.0).map_err(io::Error::other)?,
            portal_noise: Normal::new(PORTAL_RSSI_MEAN, 4.0).map_err(io::Error::other)?,
            tags: Vec::new(),
            next_serial: 1,
            clock: now_millis(),
            facility: args.facility.clone(),
        };
        for _ in 0..args.tags {
            sim.receive_stock();
        }
        Ok(sim)
    }

    fn receive_stock(&mut self) {
        // SGTIN-96 style: header 30, then a serial
        let epc = format!("3034{:020X}", self.next_serial);
        self.next_serial += 1;
        self.tags.push(SimTag {
            epc,
            fate: Fate::OnFloor,
        });
    }

    fn rssi(&mut self, portal: bool) -> i32 {
        let sample = if portal {
            self.portal_noise.sample(&mut self.rng)
        } else {
            self.floor_noise.sample(&mut self.rng)
        };
        #[allow(clippy::cast_possible_truncation)]
        let dbm = sample.round().clamp(-100.0, -20.0) as i32;
        dbm
    }

    fn read(&mut self, epc: &str, device: &str, portal: bool) -> TagRead {
        // Spread reads inside the tick so ordering inside a batch matters
        let jitter = self.rng.gen_range(0..TICK_MS);
        let rssi = self.rssi(portal);
        TagRead::new(epc, rssi, self.clock + jitter, device, self.facility.as_str())
    }

    /// One fixed-sensor batch covering the current tick.
    fn fixed_batch(&mut self, read_fraction: f64) -> (ReadBatch, Events) {
        self.clock += TICK_MS;
        let mut reads = Vec::new();
        let mut events = Events::default();

        for i in 0..self.tags.len() {
            let epc = self.tags[i].epc.clone();
            match self.tags[i].fate {
                Fate::OnFloor => {
                    if self.rng.gen_bool(0.002) {
                        self.tags[i].fate = Fate::Leaving(3);
                        events.exits += 1;
                    } else if self.rng.gen_bool(0.003) {
                        reads.push(self.read(&epc, POS_SENSOR, true));
                        self.tags[i].fate = Fate::Gone;
                        events.sales += 1;
                    } else if self.rng.gen_bool(read_fraction.clamp(0.0, 1.0)) {
                        let device = FLOOR_SENSORS[self.rng.gen_range(0..FLOOR_SENSORS.len())];
                        reads.push(self.read(&epc, device, false));
                    }
                }
                Fate::Leaving(left) => {
                    reads.push(self.read(&epc, EXIT_SENSOR, true));
                    self.tags[i].fate = if left <= 1 { Fate::Gone } else { Fate::Leaving(left - 1) };
                }
                Fate::Gone => {}
            }
        }

        if self.rng.gen_bool(0.05) {
            self.receive_stock();
            events.arrivals += 1;
        }

        let batch = ReadBatch::fixed(reads)
            .with_scope([self.facility.clone()])
            .with_controller("sim-controller");
        (batch, events)
    }

    /// Handheld sweep reading every tag still on the floor.
    fn handheld_batch(&mut self) -> ReadBatch {
        let epcs: Vec<String> = self
            .tags
            .iter()
            .filter(|t| t.fate == Fate::OnFloor)
            .map(|t| t.epc.clone())
            .collect();
        let reads = epcs
            .iter()
            .map(|epc| self.read(epc, HANDHELD, false))
            .collect();
        ReadBatch::handheld(reads).with_controller("sim-handheld")
    }

    fn on_floor(&self) -> usize {
        self.tags.iter().filter(|t| t.fate == Fate::OnFloor).count()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Events {
    exits: u32,
    sales: u32,
    arrivals: u32,
}

fn site_config(facility: &str) -> InventoryConfig {
    let mut config = InventoryConfig::default();
    config.facilities.clear();
    config.facilities.insert(facility.to_string(), FacilityConfig::default());

    let sensor = |device: &str, personality| RfidSensor {
        device_id: device.to_string(),
        facility_id: facility.to_string(),
        personality,
        min_rssi: None,
    };
    config.sensors = FLOOR_SENSORS
        .iter()
        .map(|d| sensor(d, SensorPersonality::None))
        .chain([
            sensor(EXIT_SENSOR, SensorPersonality::Exit),
            sensor(POS_SENSOR, SensorPersonality::Pos),
        ])
        .collect();
    config
}

fn emit(out: &mut impl Write, batch: &ReadBatch) -> io::Result<()> {
    let line = serde_json::to_string(batch).map_err(io::Error::other)?;
    writeln!(out, "{}", line)?;
    out.flush()
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    if args.print_config {
        let toml = site_config(&args.facility).to_toml().map_err(io::Error::other)?;
        print!("{}", toml);
        return Ok(());
    }

    let mut sim = Simulator::new(&args)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut totals = Events::default();

    if !args.quiet {
        eprintln!(
            "read-simulation: {} batches, {} tags, facility {}",
            args.batches, args.tags, args.facility
        );
    }

    for n in 1..=args.batches {
        let (batch, events) = sim.fixed_batch(args.read_fraction);
        totals.exits += events.exits;
        totals.sales += events.sales;
        totals.arrivals += events.arrivals;
        emit(&mut out, &batch)?;

        if args.handheld_every > 0 && n % args.handheld_every == 0 {
            let handheld = sim.handheld_batch();
            if !args.quiet {
                eprintln!("[batch {n}] handheld cycle count of {} tags", handheld.reads.len());
            }
            emit(&mut out, &handheld)?;
        }

        if args.interval_ms > 0 {
            std::thread::sleep(Duration::from_millis(args.interval_ms));
        }
    }

    if !args.quiet {
        eprintln!(
            "read-simulation done: {} on floor, {} walked out, {} sold, {} received",
            sim.on_floor(),
            totals.exits,
            totals.sales,
            totals.arrivals
        );
    }
    Ok(())
}
