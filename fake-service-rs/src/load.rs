//! # Load Generation
//!
//! Artificial CPU and memory pressure held for the lifetime of a request,
//! plus generation of the body sent to upstream services.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::{debug, info, warn};

/// Length of one busy + idle cycle of a CPU load thread
const CPU_DUTY_CYCLE: Duration = Duration::from_millis(100);

const PAGE_SIZE: usize = 4096;

/// CPU and memory load settings
#[derive(Debug, Clone)]
pub struct LoadConfig {
    /// Cores to load, -1 for every available core
    pub cpu_cores: i64,
    /// Percentage of each core to consume, 0 to 100
    pub cpu_percentage: f64,
    /// MHz allocated to the service, 0 when unknown
    pub cpu_allocated: i64,
    /// MHz of a single logical core
    pub cpu_clock_speed: i64,
    pub memory_bytes: usize,
    /// Percentage variance of the memory allocated per request
    pub memory_variance: u32,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            cpu_cores: -1,
            cpu_percentage: 0.0,
            cpu_allocated: 0,
            cpu_clock_speed: 1000,
            memory_bytes: 0,
            memory_variance: 0,
        }
    }
}

/// Creates per-request CPU and memory pressure
#[derive(Debug, Clone)]
pub struct LoadGenerator {
    cores: usize,
    percentage: f64,
    memory_bytes: usize,
    memory_variance: u32,
}

impl LoadGenerator {
    pub fn new(config: &LoadConfig) -> Self {
        let cores = if config.cpu_cores < 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            usize::try_from(config.cpu_cores).unwrap_or(0)
        };

        // with an allocation the percentage is of the allocated share, not the whole machine
        let mut percentage = config.cpu_percentage;
        if config.cpu_allocated > 0 && config.cpu_clock_speed > 0 && cores > 0 {
            percentage *= config.cpu_allocated as f64 / (config.cpu_clock_speed as f64 * cores as f64);
        }

        if !(0.0..=100.0).contains(&percentage) {
            warn!(percentage, "CPU load percentage outside 0-100, clamping");
            percentage = percentage.clamp(0.0, 100.0);
        }

        Self {
            cores,
            percentage,
            memory_bytes: config.memory_bytes,
            memory_variance: config.memory_variance,
        }
    }

    /// A generator that never creates load
    pub fn disabled() -> Self {
        Self {
            cores: 0,
            percentage: 0.0,
            memory_bytes: 0,
            memory_variance: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cpu_enabled() || self.memory_bytes > 0
    }

    fn cpu_enabled(&self) -> bool {
        self.cores > 0 && self.percentage > 0.0
    }

    /// Start generating load; it stops when the returned scope is dropped
    pub fn generate(&self) -> LoadScope {
        // memory first so spinning threads do not delay the allocation
        let memory = self.generate_memory();
        let (stop, threads) = self.generate_cpu();

        LoadScope {
            memory,
            stop,
            threads,
        }
    }

    fn generate_memory(&self) -> Vec<u8> {
        if self.memory_bytes == 0 {
            return Vec::new();
        }

        let mut len = self.memory_bytes;
        if self.memory_variance > 0 {
            let mut rng = rand::thread_rng();
            let change = len.saturating_mul(rng.gen_range(0..self.memory_variance) as usize) / 100;
            len = if rng.gen_bool(0.5) { len.saturating_add(change) } else { len.saturating_sub(change) };
        }

        let mut memory = vec![0u8; len];
        // touch every page so the allocation is resident
        for i in (0..len).step_by(PAGE_SIZE) {
            memory[i] = 1;
        }

        info!(bytes = len, "Allocated memory");
        memory
    }

    fn generate_cpu(&self) -> (Arc<AtomicBool>, Vec<JoinHandle<()>>) {
        let stop = Arc::new(AtomicBool::new(false));
        if !self.cpu_enabled() {
            return (stop, Vec::new());
        }

        info!(cores = self.cores, percentage = self.percentage, "Generating CPU load");

        let busy = CPU_DUTY_CYCLE.mul_f64(self.percentage / 100.0);
        let idle = CPU_DUTY_CYCLE.saturating_sub(busy);

        let threads = (0..self.cores)
            .filter_map(|core| {
                let stop = Arc::clone(&stop);
                std::thread::Builder::new()
                    .name(format!("cpu-load-{}", core))
                    .spawn(move || spin(&stop, busy, idle))
                    .map_err(|e| warn!(error = %e, "Unable to start CPU load thread"))
                    .ok()
            })
            .collect();

        (stop, threads)
    }
}

fn spin(stop: &AtomicBool, busy: Duration, idle: Duration) {
    while !stop.load(Ordering::Relaxed) {
        let begin = Instant::now();
        while begin.elapsed() < busy {
            std::hint::spin_loop();
        }

        if !idle.is_zero() {
            std::thread::sleep(idle);
        }
    }
}

/// Load held for the duration of a request
#[derive(Debug)]
pub struct LoadScope {
    memory: Vec<u8>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl LoadScope {
    /// Number of CPU load threads started for this scope
    pub fn cpu_threads(&self) -> usize {
        self.threads.len()
    }

    pub fn memory_bytes(&self) -> usize {
        self.memory.len()
    }
}

impl Drop for LoadScope {
    fn drop(&mut self) {
        // threads notice within one duty cycle; they are not joined so an
        // async caller is never blocked here
        self.stop.store(true, Ordering::Relaxed);
        if !self.threads.is_empty() {
            debug!(threads = self.threads.len(), "Stopping CPU load");
        }
    }
}

/// Produces the body sent to upstream services
pub trait RequestGenerator: Send + Sync {
    /// `None` sends a GET, anything else a POST
    fn generate(&self) -> Option<Bytes>;
}

impl<F> RequestGenerator for F
where
    F: Fn() -> Option<Bytes> + Send + Sync,
{
    fn generate(&self) -> Option<Bytes> {
        self()
    }
}

/// Never sends a body
#[derive(Debug, Default)]
pub struct NoopRequestGenerator;

impl RequestGenerator for NoopRequestGenerator {
    fn generate(&self) -> Option<Bytes> {
        None
    }
}

/// Sends the same body every time
#[derive(Debug, Clone)]
pub struct FixedRequestGenerator(Bytes);

impl FixedRequestGenerator {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self(body.into())
    }
}

impl RequestGenerator for FixedRequestGenerator {
    fn generate(&self) -> Option<Bytes> {
        Some(self.0.clone())
    }
}

/// Random bytes of `size` plus or minus up to `variance` percent
#[derive(Debug)]
pub struct RandomRequestGenerator {
    size: usize,
    variance: u32,
    rng: Mutex<StdRng>,
}

impl RandomRequestGenerator {
    pub fn new(size: usize, variance: u32, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            size,
            variance,
            rng: Mutex::new(rng),
        }
    }
}

impl RequestGenerator for RandomRequestGenerator {
    fn generate(&self) -> Option<Bytes> {
        let mut rng = match self.rng.lock() {
            Ok(rng) => rng,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut size = self.size;
        if self.variance > 0 && size > 0 {
            let change = rng.gen_range(0..size).saturating_mul(self.variance as usize) / 100;
            size = if rng.gen_bool(0.5) { size.saturating_add(change) } else { size.saturating_sub(change) };
        }

        let mut body = vec![0u8; size];
        rng.fill_bytes(&mut body);
        Some(Bytes::from(body))
    }
}

/// Pick the generator for the configured body options
///
/// A fixed body wins over a random size; neither means no body.
pub fn request_generator(body: &str, size: usize, variance: u32, seed: Option<u64>) -> Arc<dyn RequestGenerator> {
    if !body.is_empty() {
        return Arc::new(FixedRequestGenerator::new(body.to_string()));
    }

    if size > 0 {
        return Arc::new(RandomRequestGenerator::new(size, variance, seed));
    }

    Arc::new(NoopRequestGenerator)
}
