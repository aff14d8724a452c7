//! Stage scheduling.
//!
//! The scheduler is a pure function of a queue-depth snapshot: it decides how
//! many tasks each stage may move during one session call and never moves
//! tasks itself. Per-stage greediness is fixed when the session is configured.

use std::fmt;

use super::EncodeConfig;

/// Number of pipeline stages.
pub const NUM_STAGES: usize = 9;

/// One action of the pipeline, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Take a new input frame.
    AcceptFrame,
    /// Submit to scene-change detection.
    StartScd,
    /// Collect scene-change results.
    WaitScd,
    /// Submit to the temporal filter.
    StartMctf,
    /// Collect temporal filter results.
    WaitMctf,
    /// Submit to lookahead analysis.
    StartLookahead,
    /// Collect lookahead results.
    WaitLookahead,
    /// Select, configure and submit to the hardware encoder.
    StartEncode,
    /// Collect hardware results.
    WaitEncode,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; NUM_STAGES] = [
        Stage::AcceptFrame,
        Stage::StartScd,
        Stage::WaitScd,
        Stage::StartMctf,
        Stage::WaitMctf,
        Stage::StartLookahead,
        Stage::WaitLookahead,
        Stage::StartEncode,
        Stage::WaitEncode,
    ];

    /// Position in pipeline order.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether the stage submits work to a collaborator.
    pub fn is_start(self) -> bool {
        matches!(
            self,
            Self::StartScd | Self::StartMctf | Self::StartLookahead | Self::StartEncode
        )
    }

    /// Whether the stage belongs to an optional analysis step.
    pub fn is_optional(self) -> bool {
        !matches!(self, Self::AcceptFrame | Self::StartEncode | Self::WaitEncode)
    }
}

/// Set of stages.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct StageMask(u16);

impl StageMask {
    /// Empty set.
    pub const EMPTY: Self = Self(0);

    /// Add a stage.
    pub fn insert(&mut self, stage: Stage) {
        self.0 |= 1 << stage.index();
    }

    /// Whether the set contains a stage.
    pub fn contains(&self, stage: Stage) -> bool {
        self.0 & (1 << stage.index()) != 0
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Raw bits, one per stage in pipeline order.
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Stages in the set, in pipeline order.
    pub fn iter(&self) -> impl Iterator<Item = Stage> + '_ {
        Stage::ALL.into_iter().filter(|&s| self.contains(s))
    }
}

impl fmt::Debug for StageMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Queue-depth snapshot taken before scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueDepths {
    /// Tasks ready for each stage: queued input for start stages, completed
    /// tasks at the queue head for wait stages, eligible reordering tasks
    /// for encode.
    pub input: [u32; NUM_STAGES],
    /// Tasks each start stage currently has in flight.
    pub occupied: [u32; NUM_STAGES],
    /// Free tasks.
    pub free: u32,
}

impl QueueDepths {
    /// Ready tasks for a stage.
    pub fn input(&self, stage: Stage) -> u32 {
        self.input[stage.index()]
    }

    /// Set the ready tasks for a stage.
    pub fn set_input(&mut self, stage: Stage, count: u32) {
        self.input[stage.index()] = count;
    }

    /// Set the in-flight tasks of a stage.
    pub fn set_occupied(&mut self, stage: Stage, count: u32) {
        self.occupied[stage.index()] = count;
    }
}

/// Actions for one session call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StagePlan {
    /// Stages with work to do.
    pub mask: StageMask,
    /// Maximum tasks each stage may move.
    pub quota: [u32; NUM_STAGES],
}

impl StagePlan {
    /// Quota of a stage.
    pub fn quota(&self, stage: Stage) -> u32 {
        self.quota[stage.index()]
    }

    /// Whether nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.mask.is_empty()
    }
}

/// Greediness-based stage scheduler.
#[derive(Debug, Clone)]
pub struct PipelineScheduler {
    greediness: [u32; NUM_STAGES],
    async_depth: u32,
    lookahead_reserve: u32,
}

impl PipelineScheduler {
    /// Compute greediness for a configuration.
    ///
    /// Disabled stages get 0 and frame acceptance gets 1. Every other stage
    /// gets the pipeline depth minus the enabled optional stages ahead of it,
    /// but at least 1.
    pub fn new(config: &EncodeConfig) -> Self {
        let async_depth = config.async_depth.max(1);
        let scd = config.scene_change_detection;
        let mctf = config.temporal_filter;
        let lookahead = config.lookahead_enabled();

        let mut greediness = [0; NUM_STAGES];
        let mut upstream = 0;
        for (enabled, start, wait) in [
            (scd, Stage::StartScd, Stage::WaitScd),
            (mctf, Stage::StartMctf, Stage::WaitMctf),
            (lookahead, Stage::StartLookahead, Stage::WaitLookahead),
            (true, Stage::StartEncode, Stage::WaitEncode),
        ] {
            if enabled {
                let g = async_depth.saturating_sub(upstream).max(1);
                greediness[start.index()] = g;
                greediness[wait.index()] = g;
                if start.is_optional() {
                    upstream += 1;
                }
            }
        }
        greediness[Stage::AcceptFrame.index()] = 1;

        Self {
            greediness,
            async_depth,
            lookahead_reserve: if lookahead { config.lookahead_depth } else { 0 },
        }
    }

    /// Greediness of a stage.
    pub fn greediness(&self, stage: Stage) -> u32 {
        self.greediness[stage.index()]
    }

    /// Whether a stage runs in this session.
    pub fn is_enabled(&self, stage: Stage) -> bool {
        self.greediness(stage) > 0
    }

    /// Plan the actions of one call.
    ///
    /// Each quota is the smallest of the stage's greediness, the tasks ready
    /// for it and, for start stages, the free hardware slots. Encode keeps the
    /// lookahead window filled unless flushing. Flush lifts greediness but not
    /// the hardware bound.
    pub fn schedule(&self, new_input: bool, depths: &QueueDepths, flush: bool) -> StagePlan {
        let mut plan = StagePlan::default();

        for stage in Stage::ALL {
            let i = stage.index();
            if self.greediness[i] == 0 {
                continue;
            }

            let quota = match stage {
                Stage::AcceptFrame => u32::from(new_input && depths.free > 0),
                _ => {
                    let greediness = if flush { u32::MAX } else { self.greediness[i] };
                    let mut ready = depths.input[i];
                    if stage == Stage::StartEncode && !flush {
                        ready = ready.saturating_sub(self.lookahead_reserve);
                    }
                    let capacity = if stage.is_start() {
                        self.async_depth.saturating_sub(depths.occupied[i])
                    } else {
                        u32::MAX
                    };
                    greediness.min(ready).min(capacity)
                }
            };

            plan.quota[i] = quota;
            if quota > 0 {
                plan.mask.insert(stage);
            }
        }

        plan
    }
}
