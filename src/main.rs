//! Frame Prefetch CLI - Play a timeline through the frame scheduler.

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use frame_prefetch::{
    compute::{FrameScheduler, TimelineEngine},
    schema::{PrecomputeConfig, Timeline},
};

fn main() {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <config.json> [ticks]", args[0]);
        eprintln!();
        eprintln!("Play an animation timeline through the multi-core frame scheduler.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  config.json  Path to precompute configuration file");
        eprintln!("  ticks        Number of ticks to play (default: 300)");
        eprintln!();
        eprintln!("Example configuration is generated with --example flag.");
        std::process::exit(1);
    }

    if args[1] == "--example" {
        print_example_config();
        return;
    }

    let config_path = PathBuf::from(&args[1]);
    let ticks: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(300);

    let config = PrecomputeConfig::load(&config_path).unwrap_or_else(|e| {
        eprintln!("Error loading config: {}", e);
        std::process::exit(1);
    });

    // Load or generate timeline
    let timeline_path = config_path.with_extension("timeline.json");
    let timeline: Timeline = if timeline_path.exists() {
        let timeline_str = fs::read_to_string(&timeline_path).unwrap_or_else(|e| {
            eprintln!("Error reading timeline file: {}", e);
            std::process::exit(1);
        });
        serde_json::from_str(&timeline_str).unwrap_or_else(|e| {
            eprintln!("Error parsing timeline: {}", e);
            std::process::exit(1);
        })
    } else {
        Timeline::random(32, 42)
    };

    println!("Frame Prefetch Playback");
    println!("=======================");
    println!(
        "Workers: {} ({:?})",
        config.workers.count, config.workers.mode
    );
    println!("Animations: {}", timeline.animations.len());
    println!(
        "Horizon: {} ticks, batch {}",
        config.prediction.horizon_frames, config.prediction.batch_size
    );
    println!(
        "Cache: {} frames / {} KiB",
        config.cache.max_frames,
        config.cache.max_memory_bytes / 1024
    );
    println!("Ticks: {}", ticks);
    println!();

    let scheduler: FrameScheduler<TimelineEngine> =
        FrameScheduler::new(&config).unwrap_or_else(|e| {
            eprintln!("Error starting scheduler: {}", e);
            std::process::exit(1);
        });
    scheduler.attach_engine(TimelineEngine::from_timeline(&timeline));
    if let Err(e) = scheduler.start_prediction() {
        eprintln!("Warning: prediction disabled: {}", e);
    }

    let frame_budget = Duration::from_secs_f64(config.timing.target_frame_time_ms / 1000.0);
    let start = Instant::now();
    let mut missing = 0u64;

    for tick in 0..ticks {
        let frame_start = Instant::now();
        if scheduler.get_frame(tick).is_none() {
            missing += 1;
        }

        // Print progress every 10%
        if (tick + 1) % (ticks / 10).max(1) == 0 {
            let stats = scheduler.stats();
            println!(
                "  Tick {}/{}: hit rate {:.1}%, avg frame {:.3} ms, {} fallbacks",
                tick + 1,
                ticks,
                stats.hit_rate * 100.0,
                stats.average_frame_time_ms,
                stats.fallbacks
            );
        }

        if let Some(rest) = frame_budget.checked_sub(frame_start.elapsed()) {
            thread::sleep(rest);
        }
    }

    let elapsed = start.elapsed();
    let target_fps = 1000.0 / config.timing.target_frame_time_ms;

    println!();
    println!("{}", scheduler.get_performance_summary());
    println!();
    println!("Optimization for {:.1} fps:", target_fps);
    print!("{}", scheduler.optimize_for_fps(target_fps));
    println!();
    println!(
        "Time: {:.2}s ({:.1} ticks/s, {} frames missing)",
        elapsed.as_secs_f32(),
        ticks as f32 / elapsed.as_secs_f32(),
        missing
    );

    scheduler.shutdown();
}

fn print_example_config() {
    let config = PrecomputeConfig::default();
    let timeline = Timeline::random(2, 42);

    println!("Example configuration (config.json):");
    println!(
        "{}",
        serde_json::to_string_pretty(&config).unwrap_or_default()
    );
    println!();
    println!("Example timeline (config.timeline.json):");
    println!(
        "{}",
        serde_json::to_string_pretty(&timeline).unwrap_or_default()
    );
}
