//! Tidepool economics simulator
//!
//! Usage:
//!   tidepool-sim --help

use clap::{Parser, Subcommand};
use tidepool::{
    OperatorId, Platform, PlatformConfig, RewardsError, VaultId, DEFAULT_CLUSTER_SIZE,
    DROPS_PER_TIDE, SECONDS_PER_DAY, TIDEPOOL_VERSION,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "tidepool-sim")]
#[command(version = TIDEPOOL_VERSION)]
#[command(about = "Tidepool economic core simulator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full bid-to-claim lifecycle with simulated time
    Run {
        /// Bidding operators
        #[arg(short, long, default_value = "8")]
        operators: usize,

        /// Cluster size to request
        #[arg(short, long, default_value = "4")]
        cluster_size: usize,

        /// Simulated horizon in days
        #[arg(short, long, default_value = "30")]
        days: u64,

        /// Whitelist every second operator (skips the participation bond)
        #[arg(long)]
        whitelist_alternate: bool,
    },

    /// Price a hypothetical bid under the default configuration
    Quote {
        /// Discount in basis points
        #[arg(short = 'b', long, default_value = "0")]
        discount_bps: u16,

        /// Duration in days
        #[arg(short, long, default_value = "30")]
        duration: u64,

        /// Quote as a whitelisted operator
        #[arg(long)]
        whitelisted: bool,
    },

    /// Show the default economic configuration
    Info,
}

fn main() {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            operators,
            cluster_size,
            days,
            whitelist_alternate,
        } => {
            run_lifecycle(operators, cluster_size, days, whitelist_alternate);
        }
        Commands::Quote {
            discount_bps,
            duration,
            whitelisted,
        } => {
            show_quote(discount_bps, duration, whitelisted);
        }
        Commands::Info => {
            show_info();
        }
    }
}

fn run_lifecycle(operators: usize, cluster_size: usize, days: u64, whitelist_alternate: bool) {
    let genesis: u64 = 1_755_000_000;
    info!("Starting Tidepool economics simulation...");
    info!("Version: {}", TIDEPOOL_VERSION);
    info!(
        "Operators: {}, cluster size: {}, horizon: {} days",
        operators, cluster_size, days
    );

    let platform = Platform::new(PlatformConfig::default(), genesis);
    let vault = VaultId::derive(b"sim-vault");

    for i in 0..operators {
        let operator = OperatorId::derive(&(i as u64).to_le_bytes());
        if whitelist_alternate && i % 2 == 0 {
            platform.auction().set_whitelisted(operator, true, genesis);
        }
        let discount_bps = ((i % 12) as u16) * 400;
        let duration = 10 + (i as u64 % 5) * 5;
        let quote = match platform.auction().quote_for(&operator, discount_bps, duration) {
            Ok(quote) => quote,
            Err(e) => {
                warn!("operator {} quote failed: {}", operator, e);
                continue;
            }
        };
        match platform.submit_bid(operator, discount_bps, duration, quote.total_price, genesis) {
            Ok(receipt) => info!(
                "operator {} bid {} drops: {} credits, score {}",
                operator, receipt.price, receipt.credits, receipt.score
            ),
            Err(e) => warn!("operator {} bid rejected: {}", operator, e),
        }
    }

    let grant = match platform.request_cluster(vault, cluster_size, genesis) {
        Ok(grant) => grant,
        Err(e) => {
            warn!("cluster request failed: {}", e);
            return;
        }
    };
    info!(
        "cluster {} granted: {} members, {} drops to pool, rate {} drops/day",
        grant.cluster,
        grant.members.len(),
        grant.released_total,
        platform.rewards().checkpoint().daily_rate
    );
    if let Err(e) = platform.activate_cluster(grant.cluster, genesis) {
        warn!("activation failed: {}", e);
        return;
    }

    let mut claimed_total = 0u64;
    for day in 1..=days {
        let now = genesis + day * SECONDS_PER_DAY;
        match platform.perform_upkeep(now) {
            Ok(report) => info!(
                "day {}: upkeep retired {} clusters, refunded {} drops, settled {} drops",
                day,
                report.retired.len(),
                report.refunded_value,
                report.settled_rewards
            ),
            Err(RewardsError::UpkeepNotNeeded(_)) => {}
            Err(e) => warn!("day {}: upkeep failed: {}", day, e),
        }

        if day % 7 == 0 {
            match platform.claim(vault, now) {
                Ok(payout) if payout.amount > 0 => {
                    claimed_total += payout.amount;
                    info!("day {}: vault claimed {} drops", day, payout.amount);
                }
                Ok(_) => {}
                Err(e) => warn!("day {}: claim failed: {}", day, e),
            }
        }
    }

    let end = genesis + days * SECONDS_PER_DAY;
    if let Ok(payout) = platform.claim(vault, end) {
        claimed_total += payout.amount;
    }

    let stats = platform.auction().stats();
    info!("Simulation complete");
    info!("  total claimed: {} drops", claimed_total);
    info!("  pool balance: {} drops", platform.escrow().pool_balance());
    info!("  still locked: {} drops", platform.escrow().total_locked());
    info!(
        "  outstanding credits: {}",
        platform.rewards().outstanding_credits()
    );
    info!(
        "  bids: {} submitted, {} still queued, {} clusters selected",
        stats.bids_submitted, stats.queued_bids, stats.clusters_selected
    );
}

fn show_quote(discount_bps: u16, duration: u64, whitelisted: bool) {
    let platform = Platform::new(PlatformConfig::default(), 0);
    let operator = OperatorId::derive(b"quote-preview");
    if whitelisted {
        platform.auction().set_whitelisted(operator, true, 0);
    }
    match platform.auction().quote_for(&operator, discount_bps, duration) {
        Ok(quote) => {
            info!("Quote for {} days at {} bps discount:", duration, discount_bps);
            info!(
                "  base price: {} drops ({} TIDE)",
                quote.base_price,
                quote.base_price / DROPS_PER_TIDE
            );
            info!("  bond: {} drops", quote.bond);
            info!("  total: {} drops", quote.total_price);
            info!("  credits: {}", quote.credits);
            info!("  score: {}", quote.score);
        }
        Err(e) => warn!("quote failed: {}", e),
    }
}

fn show_info() {
    let config = PlatformConfig::default();
    info!("Tidepool economic core v{}", TIDEPOOL_VERSION);
    info!(
        "  expected daily yield: {} drops per slot-day",
        config.auction.expected_daily_yield
    );
    info!("  credit fee: {} drops", config.auction.credit_fee);
    info!(
        "  duration range: {}..={} days",
        config.auction.min_duration_days, config.auction.max_duration_days
    );
    info!("  max discount: {} bps", config.auction.max_discount_bps);
    info!(
        "  participation bond: {} drops",
        config.auction.participation_bond
    );
    info!(
        "  cluster size: default {}, max {}",
        DEFAULT_CLUSTER_SIZE, config.auction.max_cluster_size
    );
    info!(
        "  upkeep interval: {} seconds",
        config.rewards.upkeep_interval
    );
}
