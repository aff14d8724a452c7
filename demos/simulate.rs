//! Example: simulated H.264 encode pipeline
//!
//! Drives an encode session against an in-process encoder that takes a few
//! ticks per picture and a scene-change detector that fires at fixed frames.
//! Prints the encode order, reference lists and marking of every picture.
//!
//! Run with `RUST_LOG=debug` to trace every queue transition.

use std::collections::HashMap;

use avc_pipeline::{
    AnalysisRequest, AnalysisResult, AnalysisStage, Collaborators, EncodeBackend, EncodeConfig,
    EncodeError, EncodeOutcome, EncodeSession, EncodeSubmission, EncodedFrame, FrameInput,
    RateControlMethod, StageQuery, SubmissionHandle, TaskId,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
const NUM_FRAMES: u32 = 40;
const ENCODE_TICKS: u64 = 3;
const SCENE_CUTS: [u32; 2] = [13, 29];

/// Encoder finishing each picture a fixed number of ticks after submission.
struct SimulatedEncoder {
    clock: u64,
    next_handle: SubmissionHandle,
    jobs: HashMap<SubmissionHandle, (u64, u32)>,
}

impl EncodeBackend for SimulatedEncoder {
    fn submit(&mut self, submission: &EncodeSubmission) -> avc_pipeline::Result<SubmissionHandle> {
        let handle = self.next_handle;
        self.next_handle += 1;
        // Intra pictures and recodes cost more.
        let size = match submission.frame_type.top {
            t if t.is_intra() => 60_000,
            _ => 12_000 + 500 * submission.list0.len() as u32,
        } >> submission.recode;
        self.jobs.insert(handle, (self.clock + ENCODE_TICKS, size));
        Ok(handle)
    }

    fn query(&mut self, handle: SubmissionHandle) -> StageQuery<EncodeOutcome> {
        self.clock += 1;
        // Finished jobs stay queryable; handles are never reused.
        match self.jobs.get(&handle) {
            Some(&(ready, size)) if ready <= self.clock => {
                StageQuery::Done(EncodeOutcome {
                    encoded_size: size,
                    overflow: false,
                })
            }
            Some(_) => StageQuery::Pending,
            None => StageQuery::Error { recoverable: false },
        }
    }
}

/// Scene-change detector with a fixed verdict list.
struct SceneDetector {
    pending: HashMap<TaskId, u32>,
}

impl AnalysisStage for SceneDetector {
    fn submit(&mut self, request: &AnalysisRequest) -> avc_pipeline::Result<()> {
        self.pending.insert(request.task_id, request.display_order);
        Ok(())
    }

    fn query(&mut self, task_id: TaskId) -> StageQuery<AnalysisResult> {
        match self.pending.get(&task_id) {
            Some(order) => StageQuery::Done(AnalysisResult::SceneChange(SCENE_CUTS.contains(order))),
            None => StageQuery::Pending,
        }
    }
}

fn print_frame(frame: &EncodedFrame) {
    let refs = |list: &[avc_pipeline::ReferenceSlot]| {
        list.iter()
            .map(|r| r.display_order.to_string())
            .collect::<Vec<_>>()
            .join(",")
    };
    match frame.failure {
        Some(failure) => println!(
            "  display {:>3}  FAILED: {}",
            frame.display_order, failure
        ),
        None => println!(
            "  encode {:>3}  display {:>3}  {:<3}  poc {:>3}  frame_num {:>2}  qp {:>2}  L0 [{}]  L1 [{}]  mmco {}  {} bytes{}",
            frame.encode_order.unwrap_or_default(),
            frame.display_order,
            format!("{:?}", frame.first_type()),
            frame.poc.top,
            frame.frame_num,
            frame.qp,
            refs(&frame.list0),
            refs(&frame.list1),
            frame.marking.ops.len(),
            frame.encoded_size.unwrap_or_default(),
            if frame.scene_change { "  (scene change)" } else { "" },
        ),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_filter(tracing_subscriber::EnvFilter::from_default_env()),
        )
        .init();

    println!("H.264 pipeline simulation\n");

    let config = EncodeConfig::h264(WIDTH, HEIGHT)
        .with_gop(32, 4)
        .with_b_pyramid(2)
        .with_async_depth(4, 0)
        .with_analysis(true, false)
        .with_close_gop_for_scene_change(true)
        .with_rate_control(RateControlMethod::Cqp {
            qp_i: 24,
            qp_p: 27,
            qp_b: 29,
            max_frame_size: 50_000,
        });
    config.validate()?;

    let collaborators = Collaborators::new(Box::new(SimulatedEncoder {
        clock: 0,
        next_handle: 1,
        jobs: HashMap::new(),
    }))
    .with_scene_change(Box::new(SceneDetector {
        pending: HashMap::new(),
    }));
    let session = EncodeSession::new(config, collaborators)?;

    let mut now = 0;
    let mut encoded = 0;
    let mut failed = 0;
    let mut total_bytes = 0u64;
    let mut collect = |session: &EncodeSession| {
        while let Some(frame) = session.take_output() {
            print_frame(&frame);
            match frame.encoded_size {
                Some(size) => {
                    encoded += 1;
                    total_bytes += u64::from(size);
                }
                None => failed += 1,
            }
        }
    };

    for i in 0..NUM_FRAMES {
        let frame = FrameInput::new(u64::from(i), u64::from(i) * 33_333);
        loop {
            now += 1;
            let result = session.drive(Some(frame.clone()), now);
            collect(&session);
            match result {
                Ok(_) => break,
                Err(EncodeError::DeviceBusy) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    while !session.is_idle() {
        now += 1;
        session.flush(now)?;
        collect(&session);
    }
    session.close();

    println!(
        "\n{encoded} pictures encoded, {failed} failed, {total_bytes} bytes in {now} ticks"
    );
    Ok(())
}
