use conscript::compiler;
use conscript::vm::bytecode;
use conscript::VM;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    compile_secs: f64,
    source_run_secs: f64,
    dso_run_secs: f64,
    rust_time_secs: f64,
    instructions: u64,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    results: Vec<BenchmarkResult>,
}

// Rust reference implementations

fn rust_sum_loop() {
    let mut sum: f64 = 0.0;
    for i in 1..=1_000_000 {
        sum += i as f64;
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
    if n <= 1 { n } else { rust_fibonacci(n - 1) + rust_fibonacci(n - 2) }
}

fn rust_string_build() {
    let mut s = String::new();
    for _ in 0..20_000 {
        s.push('x');
        if s.len() > 64 {
            s = s[32..64].to_string();
        }
    }
    eprintln!("{}", s.len());
}

fn time_rust<F>(f: F) -> f64
where
    F: FnOnce(),
{
    let start = Instant::now();
    f();
    start.elapsed().as_secs_f64()
}

fn script_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scripts").join(format!("{}.cs", name))
}

fn run_script_benchmark(name: &str, rust_time_secs: f64) -> Result<BenchmarkResult, String> {
    let path = script_path(name);
    let source = std::fs::read_to_string(&path).map_err(|e| format!("{}: {}", path.display(), e))?;
    let file = path.to_string_lossy().into_owned();

    let start = Instant::now();
    let unit = compiler::compile_deferred(&file, &source).map_err(|e| e.to_string())?;
    let compile_secs = start.elapsed().as_secs_f64();
    let dso = bytecode::serialize(&unit);

    let mut vm = VM::with_output(Box::new(io::sink()));
    let start = Instant::now();
    vm.compile_exec(&file, &source).map_err(|e| e.to_string())?;
    let source_run_secs = start.elapsed().as_secs_f64();
    let instructions = vm.stats().instructions;

    let mut vm = VM::with_output(Box::new(io::sink()));
    let start = Instant::now();
    let block = vm.load_dso_bytes(&dso, &file).map_err(|e| e.to_string())?;
    vm.run_block(block).map_err(|e| e.to_string())?;
    let dso_run_secs = start.elapsed().as_secs_f64();

    Ok(BenchmarkResult {
        name: name.to_string(),
        compile_secs,
        source_run_secs,
        dso_run_secs,
        rust_time_secs,
        instructions,
    })
}

fn main() {
    let cases: [(&str, Box<dyn FnOnce()>); 4] = [
        ("sum_loop", Box::new(rust_sum_loop)),
        ("nested_loop", Box::new(rust_nested_loop)),
        ("fibonacci", Box::new(|| eprintln!("{}", rust_fibonacci(24)))),
        ("string_build", Box::new(rust_string_build)),
    ];

    let mut results = Vec::new();
    for (name, reference) in cases {
        let rust_time = time_rust(reference);
        match run_script_benchmark(name, rust_time) {
            Ok(result) => results.push(result),
            Err(e) => eprintln!("Benchmark {} failed: {}", name, e),
        }
    }

    let output = BenchmarkOutput { results };
    match serde_json::to_string_pretty(&output) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("failed to encode results: {}", e),
    }
}
