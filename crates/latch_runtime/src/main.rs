//! Latch Runtime
//!
//! Drives the transient allocator through a scripted frame on the headless
//! device and reports how the memory tiers were used.
//!
//! Usage: `latch [config.json] [frames]`

use anyhow::{Context, Result};
use latch_transient::headless::{CommandLog, HeadlessDevice, SubmissionLog};
use latch_transient::{
    AllocatorConfig, AllocatorMetrics, BindFlags, TextureFormat, TierToken, TransientAllocator,
    TransientDesc, UsageState,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FRAMES: u64 = 8;
const CLEAN_INTERVAL: u64 = 4;

/// Render resolution of the scripted frame.
const WIDTH: u32 = 1920;
const HEIGHT: u32 = 1080;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,latch_transient=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

fn load_config(path: Option<&str>) -> Result<AllocatorConfig> {
    let Some(path) = path else {
        return Ok(AllocatorConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read allocator config {path}"))?;
    AllocatorConfig::from_json(&json).with_context(|| format!("invalid allocator config {path}"))
}

/// Scene, outline and bloom passes of one frame.
fn record_frame(
    allocator: &mut TransientAllocator<HeadlessDevice>,
    cmds: &mut CommandLog,
    queue: &mut SubmissionLog,
) -> Result<()> {
    allocator.next_frame()?;

    let scene_desc = TransientDesc::color_target(WIDTH, HEIGHT, TextureFormat::Rgba16Float);
    let depth_desc = TransientDesc::depth_target(WIDTH, HEIGHT, TextureFormat::Depth32Float)
        .with_usage(BindFlags::DEPTH_STENCIL | BindFlags::SHADER_READ);

    let scene = allocator.acquire_fast(
        cmds,
        &scene_desc,
        UsageState::RenderTarget,
        Some("scene color"),
    )?;
    let depth = allocator.acquire(
        cmds,
        &depth_desc,
        UsageState::DepthWrite,
        &[TierToken::fast(64)],
        Some("scene depth"),
    )?;
    cmds.work("scene");

    // Outline mask is drawn against scene depth, which is done after it.
    let mask_desc = TransientDesc::color_target(WIDTH, HEIGHT, TextureFormat::R8Unorm);
    let mask = allocator.acquire_fast(
        cmds,
        &mask_desc,
        UsageState::RenderTarget,
        Some("outline mask"),
    )?;
    cmds.work("outline mask");
    allocator.release(cmds, &depth, UsageState::PixelShaderResource)?;

    let outline_desc = TransientDesc::color_target(WIDTH, HEIGHT, TextureFormat::Rgba8Unorm);
    let outline = allocator.acquire_fast(
        cmds,
        &outline_desc,
        UsageState::RenderTarget,
        Some("outline"),
    )?;
    cmds.work("outline composite");
    allocator.release(cmds, &mask, UsageState::PixelShaderResource)?;
    allocator.release(cmds, &outline, UsageState::PixelShaderResource)?;

    // Bloom downsample chain, each level read by the next.
    let mut previous = None;
    for level in 1..=4u32 {
        let desc = TransientDesc::new(
            (WIDTH >> level).max(1),
            (HEIGHT >> level).max(1),
            TextureFormat::Rg11b10Ufloat,
            BindFlags::UNORDERED_ACCESS | BindFlags::SHADER_READ,
        );
        let target = allocator.acquire(
            cmds,
            &desc,
            UsageState::UnorderedAccess,
            &[TierToken::fast_remaining()],
            Some("bloom"),
        )?;
        cmds.work("bloom downsample");
        if let Some(source) = previous.replace(target) {
            allocator.release(cmds, &source, UsageState::NonPixelShaderResource)?;
        }
    }
    if let Some(last) = previous {
        allocator.release(cmds, &last, UsageState::NonPixelShaderResource)?;
    }

    cmds.work("tonemap");
    allocator.release(cmds, &scene, UsageState::PixelShaderResource)?;

    allocator.finalize(queue)?;
    Ok(())
}

fn main() -> Result<()> {
    init_logging();

    let args: Vec<String> = std::env::args().collect();
    let config = load_config(args.get(1).map(String::as_str))?;
    let frames = match args.get(2) {
        Some(frames) => frames
            .parse()
            .with_context(|| format!("frame count {frames:?} is not a number"))?,
        None => DEFAULT_FRAMES,
    };

    tracing::info!("Latch transient allocator v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!(config = %serde_json::to_string(&config)?, "allocator config");

    let device = HeadlessDevice::new(latch_paging::FAST_TIER_SIZE_BYTES);
    let mut allocator = TransientAllocator::new(device.clone(), &device.capabilities(), &config)?;

    let mut cmds = CommandLog::new();
    let mut queue = SubmissionLog::new();
    for frame in 1..=frames {
        cmds.clear();
        record_frame(&mut allocator, &mut cmds, &mut queue)?;

        let stats = allocator.stats();
        tracing::info!(
            frame,
            peak_main_blocks = stats.main_high_water_mark,
            main_blocks = stats.main_block_count,
            flushes = cmds.flushes().len(),
            transitions = cmds.transitions(),
            instances = stats.cached_instances,
            "frame recorded"
        );

        if frame % CLEAN_INTERVAL == 0 {
            allocator.clean()?;
        }
    }

    let metrics = allocator.metrics();
    tracing::info!(
        frames,
        acquires = metrics.count(AllocatorMetrics::ACQUIRES),
        flushes = metrics.count(AllocatorMetrics::FLUSHES),
        spilled_pages = metrics.count(AllocatorMetrics::SPILLED_PAGES),
        peak_fast_pages = metrics.peak_fast_pages(),
        peak_main_pages = metrics.peak_main_pages(),
        mapped_pages = queue.mapped_pages(),
        live_resources = device.live_resources(),
        "run complete"
    );

    allocator.uninitialize()?;
    Ok(())
}
