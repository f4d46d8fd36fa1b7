//! Deterministic payment selection and rank computation.

use std::sync::{Arc, Mutex};

use merged_consensus::constants::{MN_WINNER_MINIMUM_AGE, TARGET_BLOCK_SPACING};
use merged_primitives::OutPoint;
use primitive_types::U256;
use tracing::debug;

use crate::context::{ChainOracle, PaymentOracle};
use crate::entry::Masternode;
use crate::registry::Registry;
use crate::score::{compact_score, score};
use crate::spork::{SporkId, SporkStore};

/// Sentinel compact score pinning disabled entries to the rank bottom.
const DISABLED_SCORE: i64 = 9999;

/// Reads the registry and the oracles to answer "who gets paid at height H"
/// and to order the whole set for that height.
pub struct PaymentPicker {
    registry: Arc<Mutex<Registry>>,
    chain: Arc<dyn ChainOracle>,
    payments: Arc<dyn PaymentOracle>,
    sporks: Arc<SporkStore>,
}

impl PaymentPicker {
    pub fn new(
        registry: Arc<Mutex<Registry>>,
        chain: Arc<dyn ChainOracle>,
        payments: Arc<dyn PaymentOracle>,
        sporks: Arc<SporkStore>,
    ) -> Self {
        Self {
            registry,
            chain,
            payments,
            sporks,
        }
    }

    /// The next masternode in the payment queue for `height`, along with the
    /// number of candidates that survived filtering.
    ///
    /// Scans the oldest-paid decile and pays its best-scored member, scored
    /// against the block hash 100 blocks back so the current miner cannot
    /// steer the choice.
    pub fn next_for_payment(&self, height: i64, filter_sig_time: bool) -> (Option<Masternode>, usize) {
        let Ok(mut registry) = self.registry.lock() else {
            return (None, 0);
        };
        self.next_in_queue(&mut registry, height, filter_sig_time)
    }

    fn next_in_queue(
        &self,
        registry: &mut Registry,
        height: i64,
        filter_sig_time: bool,
    ) -> (Option<Masternode>, usize) {
        let now = self.chain.adjusted_time();
        let min_protocol = self.payments.min_payment_protocol();
        let enabled = registry.count_enabled(now, &self.chain, min_protocol) as i64;

        let mut last_paid: Vec<(i64, OutPoint)> = Vec::new();
        for entry in registry.entries() {
            if !entry.is_enabled() || entry.protocol_version < min_protocol {
                continue;
            }
            // Already queued within the look-ahead window; skip it.
            if self
                .payments
                .is_scheduled(&entry.collateral, &entry.payee_script(), height)
            {
                continue;
            }
            // Too new: wait a full payment cycle before the first payout.
            if filter_sig_time && entry.sig_time + enabled * TARGET_BLOCK_SPACING > now {
                continue;
            }
            // The collateral needs as many confirmations as there are nodes.
            if entry.collateral_confirmations(&self.chain) < enabled {
                continue;
            }
            last_paid.push((entry.seconds_since_payment(now), entry.collateral));
        }

        let count = last_paid.len();

        // While the network upgrades, do not penalize recently restarted
        // nodes: retry without the age filter.
        if filter_sig_time && (count as i64) < enabled / 3 {
            return self.next_in_queue(registry, height, false);
        }

        // Oldest payments first; stable sort keeps registry order on ties.
        last_paid.sort_by(|a, b| b.0.cmp(&a.0));

        let score_hash = self.chain.block_hash(height - 100);
        let tenth = enabled / 10;
        let mut best: Option<(U256, OutPoint)> = None;
        let mut scanned = 0i64;
        for (_, collateral) in &last_paid {
            let entry_score = match &score_hash {
                Some(hash) => score(collateral, hash, 1),
                None => U256::zero(),
            };
            if best
                .as_ref()
                .map(|(high, _)| entry_score > *high)
                .unwrap_or(entry_score > U256::zero())
            {
                best = Some((entry_score, *collateral));
            }
            scanned += 1;
            if scanned >= tenth {
                break;
            }
        }

        let winner = best.and_then(|(_, collateral)| registry.get(&collateral));
        if winner.is_none() {
            debug!(height, count, "no payment candidate");
        }
        (winner, count)
    }

    /// 1-based rank of a collateral at `height`, or -1 when the block hash
    /// is unknown or the entry did not qualify.
    pub fn rank(&self, collateral: &OutPoint, height: i64, min_protocol: i32, only_active: bool) -> i32 {
        let Some(block_hash) = self.chain.block_hash(height) else {
            return -1;
        };
        let Ok(mut registry) = self.registry.lock() else {
            return -1;
        };
        let now = self.chain.adjusted_time();
        let age_enforced = self.sporks.is_active(SporkId::PaymentEnforcement, now);

        let mut scores: Vec<(i64, OutPoint)> = Vec::new();
        for entry in registry.entries_mut() {
            if entry.protocol_version < min_protocol {
                continue;
            }
            if age_enforced && now - entry.sig_time < MN_WINNER_MINIMUM_AGE {
                continue;
            }
            if only_active {
                entry.check(now, &self.chain, false);
                if !entry.is_enabled() {
                    continue;
                }
            }
            scores.push((compact_score(&entry.collateral, &block_hash, 1), entry.collateral));
        }

        scores.sort_by(|a, b| b.0.cmp(&a.0));
        for (position, (_, entry_collateral)) in scores.iter().enumerate() {
            if entry_collateral == collateral {
                return position as i32 + 1;
            }
        }
        -1
    }

    /// The entry holding rank `rank` at `height`.
    pub fn by_rank(
        &self,
        rank: i32,
        height: i64,
        min_protocol: i32,
        only_active: bool,
    ) -> Option<Masternode> {
        if rank < 1 {
            return None;
        }
        let block_hash = self.chain.block_hash(height)?;
        let Ok(mut registry) = self.registry.lock() else {
            return None;
        };
        let now = self.chain.adjusted_time();

        let mut scores: Vec<(i64, OutPoint)> = Vec::new();
        for entry in registry.entries_mut() {
            if entry.protocol_version < min_protocol {
                continue;
            }
            if only_active {
                entry.check(now, &self.chain, false);
                if !entry.is_enabled() {
                    continue;
                }
            }
            scores.push((compact_score(&entry.collateral, &block_hash, 1), entry.collateral));
        }

        scores.sort_by(|a, b| b.0.cmp(&a.0));
        let target = scores.get(rank as usize - 1)?;
        registry.get(&target.1)
    }

    /// Every entry with its rank, disabled entries pinned to the bottom by
    /// the sentinel score.
    pub fn all_ranks(&self, height: i64, min_protocol: i32) -> Vec<(i32, Masternode)> {
        let Some(block_hash) = self.chain.block_hash(height) else {
            return Vec::new();
        };
        let Ok(mut registry) = self.registry.lock() else {
            return Vec::new();
        };
        let now = self.chain.adjusted_time();
        registry.check(now, &self.chain);

        let mut scores: Vec<(i64, Masternode)> = Vec::new();
        for entry in registry.entries() {
            if entry.protocol_version < min_protocol {
                continue;
            }
            let entry_score = if entry.is_enabled() {
                compact_score(&entry.collateral, &block_hash, 1)
            } else {
                DISABLED_SCORE
            };
            scores.push((entry_score, entry.clone()));
        }

        scores.sort_by(|a, b| b.0.cmp(&a.0));
        scores
            .into_iter()
            .enumerate()
            .map(|(position, (_, entry))| (position as i32 + 1, entry))
            .collect()
    }

    /// The plain highest-compact-score winner over enabled entries at
    /// `height` with the given modifier.
    pub fn current(&self, modifier: u32, height: i64, min_protocol: i32) -> Option<Masternode> {
        let block_hash = self.chain.block_hash(height)?;
        let Ok(mut registry) = self.registry.lock() else {
            return None;
        };
        let now = self.chain.adjusted_time();
        registry.check(now, &self.chain);

        let mut best: Option<(i64, OutPoint)> = None;
        for entry in registry.entries() {
            if entry.protocol_version < min_protocol || !entry.is_enabled() {
                continue;
            }
            let entry_score = compact_score(&entry.collateral, &block_hash, modifier);
            if best
                .as_ref()
                .map(|(high, _)| entry_score > *high)
                .unwrap_or(entry_score > 0)
            {
                best = Some((entry_score, entry.collateral));
            }
        }
        best.and_then(|(_, collateral)| registry.get(&collateral))
    }
}
