//! Albor Space gNB MAC scheduler simulator
//!
//! Drives the MAC layer slot by slot against an emulated PHY: traffic is
//! offered as buffer status reports, every scheduled block is answered with a
//! SINR report and the resulting HARQ outcomes are tallied.

mod config;
mod phy_emulator;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info, trace, warn};
use tracing_subscriber::{fmt, EnvFilter};

use common::types::{BeamId, Direction};
use common::utils::time::sfn_slot;
use interfaces::message_types::{HarqOutcome, SlotIndication, UeConfigRequest};
use layers::mac::{MacLayer, MacPhyInterface, MacSchedInterface};

use crate::config::SimConfig;
use crate::phy_emulator::PhyEmulator;

/// Albor Space gNB MAC scheduler simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error), overrides the file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Number of slots to simulate
    #[arg(long, default_value = "1000")]
    slots: u64,

    /// Pace the loop at the numerology's slot duration
    #[arg(long)]
    realtime: bool,

    /// Scheduling policy (rr, pf, mr, random), overrides the file
    #[arg(long)]
    policy: Option<String>,

    /// Access mode (tdma, ofdma), overrides the file
    #[arg(long)]
    access: Option<String>,
}

/// HARQ outcome counters for the whole run
#[derive(Debug, Default)]
struct OutcomeTally {
    acked: u64,
    retransmit: u64,
    dropped: u64,
    ignored: u64,
}

impl OutcomeTally {
    fn record(&mut self, outcome: HarqOutcome) {
        match outcome {
            HarqOutcome::Acked => self.acked += 1,
            HarqOutcome::Retransmit { .. } => self.retransmit += 1,
            HarqOutcome::Dropped => self.dropped += 1,
            HarqOutcome::Ignored => self.ignored += 1,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut sim_config = match &args.config {
        Some(path) => SimConfig::from_yaml_file(path)?,
        None => SimConfig::default(),
    };
    if let Some(policy) = &args.policy {
        sim_config.scheduler.policy = policy.clone();
    }
    if let Some(access) = &args.access {
        sim_config.scheduler.access = access.clone();
    }

    // Initialize logging
    let log_level = args.log_level.clone().unwrap_or_else(|| sim_config.log.level.clone());
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&log_level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Albor Space gNB MAC simulator");
    if let Some(path) = &args.config {
        info!("Configuration file: {}", path);
    }

    let mac_config = sim_config.to_mac_config()?;
    info!("Cell configuration:");
    info!("  Cell ID: {}", mac_config.cell_id.0);
    info!("  Frequency: {} MHz", sim_config.cell.center_frequency_mhz);
    info!("  Bandwidth: {} MHz ({} RBs, {} RBGs)",
          sim_config.cell.channel_bandwidth_mhz, mac_config.num_rbs(), mac_config.num_rbg());
    info!("  Subcarrier spacing: {} kHz", mac_config.scs.khz());
    info!("  Scheduler: {} / {}", mac_config.scheduler.policy, mac_config.scheduler.access);

    let mut mac_layer = MacLayer::new(mac_config.clone())?;
    mac_layer.initialize().await?;
    info!("MAC layer initialized");

    let mut phy = PhyEmulator::new(
        mac_config.num_rbs(),
        mac_config.scheduler.rbg_size,
        sim_config.channel.fading_db,
        sim_config.channel.seed,
    );
    for profile in &sim_config.ues {
        let request = UeConfigRequest::new(profile.rnti(), BeamId(profile.beam))
            .with_cqi(profile.initial_cqi);
        mac_layer.configure_ue(request).await?;
        phy.add_ue(profile);
        info!("UE {} configured on beam {} ({:.1} dB)", profile.rnti, profile.beam, profile.sinr_db);
    }

    let slot_duration = mac_config.scs.slot_duration();
    let mut ticker = tokio::time::interval(slot_duration);
    let mut tally = OutcomeTally::default();

    for slot in 0..args.slots {
        if args.realtime {
            ticker.tick().await;
        }

        for report in phy.traffic_arrivals() {
            mac_layer.buffer_status(report).await?;
        }

        let allocation = mac_layer.slot_indication(SlotIndication { slot }).await?;
        if !allocation.is_empty() {
            let (sfn, slot_in_frame) = sfn_slot(slot, mac_config.scs);
            debug!("SFN {} slot {}: {} allocations", sfn, slot_in_frame, allocation.allocations.len());
            match allocation.to_json() {
                Ok(json) => trace!("{}", json),
                Err(e) => warn!("Failed to serialize slot {}: {}", slot, e),
            }
        }

        for report in phy.transmit(&allocation) {
            let result = mac_layer.sinr_report(report).await?;
            tally.record(result.outcome);
        }
    }

    info!("Simulation finished after {} slots", args.slots);
    info!("  HARQ outcomes: {} acked, {} retransmitted, {} dropped, {} ignored",
          tally.acked, tally.retransmit, tally.dropped, tally.ignored);

    let seconds = args.slots as f64 * slot_duration.as_secs_f64();
    {
        let scheduler = mac_layer.scheduler();
        let scheduler = scheduler.lock().await;
        for ue in scheduler.ues() {
            for direction in Direction::ALL {
                let link = ue.link(direction);
                let stats = &link.stats;
                let throughput_mbps = if seconds > 0.0 {
                    stats.delivered_bytes as f64 * 8.0 / seconds / 1e6
                } else {
                    0.0
                };
                info!("UE {} {}: MCS {} CQI {}, {} new / {} retx, {} ACK / {} NACK / {} dropped, {:.2} Mbps",
                      ue.rnti, direction, link.mcs, link.cqi, stats.new_tx, stats.retx,
                      stats.acks, stats.nacks, stats.drops, throughput_mbps);
            }
        }
    }

    mac_layer.shutdown().await?;
    info!("MAC simulator shutdown complete");
    Ok(())
}
