use cyberbasic::compiler::{compile_source, run_file_capturing_output};
use cyberbasic::config::RuntimeConfig;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    compile_secs: f64,
    run_secs: f64,
    rust_time_secs: Option<f64>,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    results: Vec<BenchmarkResult>,
}

// Rust reference implementations

fn rust_sum_loop() {
    let mut sum: i64 = 0;
    for i in 1..=1_000_000 {
        sum += i;
    }
    eprintln!("{}", sum);
}

fn rust_nested_loop() {
    let mut sum: i64 = 0;
    for i in 0..500 {
        for j in 0..500 {
            sum += i * j;
        }
    }
    eprintln!("{}", sum);
}

fn rust_fibonacci(n: i32) -> i32 {
    if n <= 1 {
        n
    } else {
        rust_fibonacci(n - 1) + rust_fibonacci(n - 2)
    }
}

fn time_rust<F>(f: F) -> f64
where
    F: FnOnce(),
{
    let start = Instant::now();
    f();
    start.elapsed().as_secs_f64()
}

fn program_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("programs")
        .join(format!("{}.bas", name))
}

/// Time compilation and a full run of one program.
fn run_basic_benchmark(name: &str, rust_time_secs: Option<f64>) -> BenchmarkResult {
    let path = program_path(name);
    let source = std::fs::read_to_string(&path).unwrap_or_default();

    let start = Instant::now();
    if let Err(e) = compile_source(name, &source) {
        eprintln!("CyberBasic benchmark {} failed to compile: {}", name, e);
    }
    let compile_secs = start.elapsed().as_secs_f64();

    let start = Instant::now();
    match run_file_capturing_output(&path, &RuntimeConfig::default()) {
        Ok(output) => eprint!("{}", output),
        Err(e) => eprintln!("CyberBasic benchmark {} failed: {}", name, e),
    }
    let run_secs = start.elapsed().as_secs_f64();

    BenchmarkResult {
        name: name.to_string(),
        compile_secs,
        run_secs,
        rust_time_secs,
    }
}

fn main() {
    let results = vec![
        run_basic_benchmark("sum_loop", Some(time_rust(rust_sum_loop))),
        run_basic_benchmark("nested_loop", Some(time_rust(rust_nested_loop))),
        run_basic_benchmark(
            "fibonacci",
            Some(time_rust(|| eprintln!("{}", rust_fibonacci(25)))),
        ),
        run_basic_benchmark("coroutines", None),
    ];

    let output = BenchmarkOutput { results };
    match serde_json::to_string_pretty(&output) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("failed to encode results: {}", e),
    }
}
