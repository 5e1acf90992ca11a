/*
 * Binary Log
 *
 * Persists the event stream as a sequence of self-contained bincode
 * records. Chains are encoded structurally: per frame the thread identity
 * plus its relationship (child or sibling module) to the previous frame, so
 * a replayer can rebuild the evolving chain without access to the original
 * hierarchy.
 *
 * replay() decodes a record stream back into any event sink, reconstructing
 * modules, threads and per-core chains as it goes.
 */

use std::collections::HashMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::cpu::context::Chain;
use crate::module::{ModuleId, ModuleTable};
use crate::sink::{CpuView, EventSink, SwitchTarget};
use crate::threads::{CoreStats, ThreadKey, ThreadSpec, ThreadStatsMap, ThreadTable};
use crate::time::Time;

/// Relationship of a frame's module to the one below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relationship {
    /// The frame's module is a child of the previous frame's module.
    Child,
    /// Same module as the previous frame.
    Sibling,
}

/// One frame of an encoded chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub module: String,
    pub tid: String,
    /// `None` only for the first frame of an initial chain.
    pub relationship: Option<Relationship>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpuRecord {
    pub uid: usize,
    pub current_time: Time,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventRecord {
    InitCore {
        chain: Vec<FrameRecord>,
    },
    ContextSwitch {
        split_index: Option<usize>,
        appendix: Option<Vec<FrameRecord>>,
        cost: Time,
    },
    ThreadExecute {
        runtime: Time,
    },
    ThreadYield,
    CpuIdle {
        idle_time: Time,
    },
    TimerInterrupt {
        idx: usize,
        delay: Time,
    },
}

/// One persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Record {
    Event { cpu: CpuRecord, event: EventRecord },
    ThreadStatistics(ThreadStatsMap),
    CpuStatistics(Vec<CoreStats>),
}

/// Binary logger.
pub struct BinaryLog<W: Write> {
    stream: W,
}

impl<W: Write> BinaryLog<W> {
    pub fn new(stream: W) -> BinaryLog<W> {
        BinaryLog { stream }
    }

    pub fn into_inner(self) -> W {
        self.stream
    }

    fn write(&mut self, record: &Record) {
        if let Err(error) = bincode::serialize_into(&mut self.stream, record) {
            log::error!("[BinaryLog] write failed: {error}");
        }
    }

    fn event(&mut self, cpu: &CpuView, event: EventRecord) {
        self.write(&Record::Event {
            cpu: CpuRecord {
                uid: cpu.uid,
                current_time: cpu.current_time,
            },
            event,
        });
    }
}

/// Encode a chain frame by frame.
///
/// `below` is the thread the first frame will sit on top of (the current
/// top for an appendix, nothing for an initial chain).
fn encode_chain(cpu: &CpuView, chain: &Chain, below: Option<ThreadKey>) -> Vec<FrameRecord> {
    let mut frames = Vec::with_capacity(chain.len());
    let mut prev = below;
    for frame in chain.frames() {
        let thread = frame.thread;
        let relationship = prev.map(|prev| {
            let module = cpu.module_of(thread);
            if cpu.modules.is_child_of(module, cpu.module_of(prev)) {
                Relationship::Child
            } else {
                debug_assert_eq!(module, cpu.module_of(prev));
                Relationship::Sibling
            }
        });
        frames.push(FrameRecord {
            module: cpu.module_name(thread).into(),
            tid: cpu.tid(thread).into(),
            relationship,
        });
        prev = Some(thread);
    }
    frames
}

impl<W: Write> EventSink for BinaryLog<W> {
    fn init_core(&mut self, cpu: &CpuView) {
        let chain = encode_chain(cpu, cpu.chain, None);
        self.event(cpu, EventRecord::InitCore { chain });
    }

    fn context_switch(&mut self, cpu: &CpuView, target: &SwitchTarget, cost: Time) {
        let (split_index, appendix) = match target {
            SwitchTarget::Split(idx) => (Some(*idx), None),
            SwitchTarget::Append(chain) => {
                (None, Some(encode_chain(cpu, chain, Some(cpu.chain.top()))))
            }
        };
        self.event(
            cpu,
            EventRecord::ContextSwitch {
                split_index,
                appendix,
                cost,
            },
        );
    }

    fn thread_execute(&mut self, cpu: &CpuView, runtime: Time) {
        self.event(cpu, EventRecord::ThreadExecute { runtime });
    }

    fn thread_yield(&mut self, cpu: &CpuView) {
        self.event(cpu, EventRecord::ThreadYield);
    }

    fn cpu_idle(&mut self, cpu: &CpuView, idle_time: Time) {
        self.event(cpu, EventRecord::CpuIdle { idle_time });
    }

    fn timer_interrupt(&mut self, cpu: &CpuView, idx: usize, delay: Time) {
        self.event(cpu, EventRecord::TimerInterrupt { idx, delay });
    }

    fn thread_statistics(&mut self, stats: &ThreadStatsMap) {
        self.write(&Record::ThreadStatistics(stats.clone()));
    }

    fn cpu_statistics(&mut self, stats: &[CoreStats]) {
        self.write(&Record::CpuStatistics(stats.to_vec()));
    }
}

/// Reconstructed world state while replaying a record stream.
struct ReplayState {
    modules: ModuleTable,
    threads: ThreadTable,
    module_ids: HashMap<String, ModuleId>,
    thread_keys: HashMap<(ModuleId, String), ThreadKey>,
    /// Chain per core uid.
    chains: HashMap<usize, Chain>,
}

impl ReplayState {
    fn new() -> ReplayState {
        ReplayState {
            modules: ModuleTable::new(),
            threads: ThreadTable::new(),
            module_ids: HashMap::new(),
            thread_keys: HashMap::new(),
            chains: HashMap::new(),
        }
    }

    fn module(&mut self, name: &str, parent: Option<ModuleId>) -> ModuleId {
        if let Some(&id) = self.module_ids.get(name) {
            return id;
        }
        let id = self
            .modules
            .add_module(name, parent)
            .expect("fresh module name");
        self.module_ids.insert(name.into(), id);
        id
    }

    fn thread(&mut self, module: ModuleId, tid: &str) -> ThreadKey {
        if let Some(&key) = self.thread_keys.get(&(module, tid.to_string())) {
            return key;
        }
        let key = self.threads.add_worker(
            &mut self.modules,
            module,
            ThreadSpec {
                tid: Some(tid.into()),
                ..ThreadSpec::default()
            },
        );
        self.thread_keys.insert((module, tid.into()), key);
        key
    }

    /// Decode an encoded chain against the current chain of `uid`.
    fn decode_chain(&mut self, uid: usize, frames: &[FrameRecord], initial: bool) -> Chain {
        let mut below = if initial {
            None
        } else {
            Some(self.chains[&uid].top())
        };

        let mut chain: Option<Chain> = None;
        for record in frames {
            let module = match (record.relationship, below) {
                (None, _) => {
                    assert!(initial, "relationship missing mid-chain");
                    self.module(&record.module, None)
                }
                (Some(Relationship::Child), Some(prev)) => {
                    let parent = self.threads.module_of(prev);
                    self.module(&record.module, Some(parent))
                }
                (Some(Relationship::Sibling), Some(prev)) => self.threads.module_of(prev),
                (Some(_), None) => panic!("relationship without a previous frame"),
            };
            let key = self.thread(module, &record.tid);
            let link = Chain::from_thread(key, &self.threads);
            match &mut chain {
                Some(chain) => chain.append_chain(link),
                None => chain = Some(link),
            }
            below = Some(key);
        }
        chain.expect("empty encoded chain")
    }

    fn view<'a>(&'a self, uid: usize, current_time: Time) -> CpuView<'a> {
        CpuView {
            uid,
            current_time,
            chain: &self.chains[&uid],
            threads: &self.threads,
            modules: &self.modules,
        }
    }
}

/// Play a binary record stream into another sink.
pub fn replay<R: Read>(mut reader: R, sink: &mut dyn EventSink) -> bincode::Result<()> {
    let mut state = ReplayState::new();

    loop {
        let record: Record = match bincode::deserialize_from(&mut reader) {
            Ok(record) => record,
            Err(error) => {
                if let bincode::ErrorKind::Io(io) = &*error
                    && io.kind() == std::io::ErrorKind::UnexpectedEof
                {
                    return Ok(());
                }
                return Err(error);
            }
        };

        match record {
            Record::Event { cpu, event } => {
                let uid = cpu.uid;
                match event {
                    EventRecord::InitCore { chain } => {
                        assert!(
                            !state.chains.contains_key(&uid),
                            "init_core found twice for same core"
                        );
                        let decoded = state.decode_chain(uid, &chain, true);
                        state.chains.insert(uid, decoded);
                        sink.init_core(&state.view(uid, cpu.current_time));
                    }
                    EventRecord::ContextSwitch {
                        split_index,
                        appendix,
                        cost,
                    } => match (split_index, appendix) {
                        (Some(idx), None) => {
                            sink.context_switch(
                                &state.view(uid, cpu.current_time),
                                &SwitchTarget::Split(idx),
                                cost,
                            );
                            let chain = state.chains.get_mut(&uid).expect("unknown core");
                            let _ = chain.split(idx + 1);
                        }
                        (None, Some(frames)) => {
                            let decoded = state.decode_chain(uid, &frames, false);
                            sink.context_switch(
                                &state.view(uid, cpu.current_time),
                                &SwitchTarget::Append(&decoded),
                                cost,
                            );
                            let chain = state.chains.get_mut(&uid).expect("unknown core");
                            chain.append_chain(decoded);
                        }
                        _ => panic!("context switch needs exactly one of split/appendix"),
                    },
                    EventRecord::ThreadExecute { runtime } => {
                        sink.thread_execute(&state.view(uid, cpu.current_time), runtime);
                    }
                    EventRecord::ThreadYield => {
                        sink.thread_yield(&state.view(uid, cpu.current_time));
                    }
                    EventRecord::CpuIdle { idle_time } => {
                        sink.cpu_idle(&state.view(uid, cpu.current_time), idle_time);
                    }
                    EventRecord::TimerInterrupt { idx, delay } => {
                        sink.timer_interrupt(&state.view(uid, cpu.current_time), idx, delay);
                    }
                }
            }
            Record::ThreadStatistics(stats) => sink.thread_statistics(&stats),
            Record::CpuStatistics(stats) => sink.cpu_statistics(&stats),
        }
    }
}

/// Read the thread statistics record from a binary log.
pub fn read_thread_statistics<R: Read>(mut reader: R) -> bincode::Result<Option<ThreadStatsMap>> {
    loop {
        let record: Record = match bincode::deserialize_from(&mut reader) {
            Ok(record) => record,
            Err(error) => {
                if let bincode::ErrorKind::Io(io) = &*error
                    && io.kind() == std::io::ErrorKind::UnexpectedEof
                {
                    return Ok(None);
                }
                return Err(error);
            }
        };
        if let Record::ThreadStatistics(stats) = record {
            return Ok(Some(stats));
        }
    }
}
