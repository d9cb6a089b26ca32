//! Random handle operation sequences checked against a counting model.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use proptest::prelude::*;

use super::control_block::BLOCKS_FINALIZED;
use super::{StrongHandle, WeakHandle};

struct DetectDrop(Arc<AtomicUsize>);

impl Drop for DetectDrop {
    fn drop(&mut self) {
        self.0.fetch_add(1, Relaxed);
    }
}

#[derive(Debug, Clone)]
enum Op {
    CloneStrong(usize),
    DropStrong(usize),
    ResetStrong(usize),
    AssignStrong(usize, usize),
    Downgrade(usize),
    CloneWeak(usize),
    DropWeak(usize),
    Lock(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..8).prop_map(Op::CloneStrong),
        (0usize..8).prop_map(Op::DropStrong),
        (0usize..8).prop_map(Op::ResetStrong),
        (0usize..8, 0usize..8).prop_map(|(a, b)| Op::AssignStrong(a, b)),
        (0usize..8).prop_map(Op::Downgrade),
        (0usize..8).prop_map(Op::CloneWeak),
        (0usize..8).prop_map(Op::DropWeak),
        (0usize..8).prop_map(Op::Lock),
    ]
}

struct World {
    strong: Vec<StrongHandle<DetectDrop>>,
    weak: Vec<WeakHandle<DetectDrop>>,
    drops: Arc<AtomicUsize>,
    blocks_before: usize,
    ever_dead: bool,
}

fn finalized_blocks() -> usize {
    BLOCKS_FINALIZED.with(|count| count.get())
}

impl World {
    fn new() -> World {
        let drops = Arc::new(AtomicUsize::new(0));
        World {
            strong: vec![StrongHandle::new(DetectDrop(drops.clone()))],
            weak: Vec::new(),
            drops,
            blocks_before: finalized_blocks(),
            ever_dead: false,
        }
    }

    fn live_strong(&self) -> usize {
        self.strong.iter().filter(|s| !s.is_empty()).count()
    }

    /// Downgrading an empty strong handle yields an empty weak handle,
    /// which observes nothing.
    fn held_weak(&self) -> impl Iterator<Item = &WeakHandle<DetectDrop>> {
        self.weak.iter().filter(|w| !w.ptr_eq(&WeakHandle::empty()))
    }

    fn apply(&mut self, op: Op) {
        let ns = self.strong.len();
        let nw = self.weak.len();
        match op {
            Op::CloneStrong(i) if ns > 0 => {
                let copy = self.strong[i % ns].clone();
                self.strong.push(copy);
            }
            Op::DropStrong(i) if ns > 0 => {
                self.strong.swap_remove(i % ns);
            }
            Op::ResetStrong(i) if ns > 0 => self.strong[i % ns].reset(),
            Op::AssignStrong(i, j) if ns > 0 => {
                let source = self.strong[j % ns].clone();
                self.strong[i % ns].assign(&source);
            }
            Op::Downgrade(i) if ns > 0 => {
                let weak = StrongHandle::downgrade(&self.strong[i % ns]);
                self.weak.push(weak);
            }
            Op::CloneWeak(i) if nw > 0 => {
                let copy = self.weak[i % nw].clone();
                self.weak.push(copy);
            }
            Op::DropWeak(i) if nw > 0 => {
                self.weak.swap_remove(i % nw);
            }
            Op::Lock(i) if nw > 0 => {
                let promoted = self.weak[i % nw].lock();
                if !promoted.is_empty() {
                    self.strong.push(promoted);
                }
            }
            _ => {}
        }
    }

    fn check(&mut self) -> Result<(), TestCaseError> {
        let live = self.live_strong();
        let drops = self.drops.load(Relaxed);
        if live > 0 {
            prop_assert!(!self.ever_dead, "payload came back after being finalized");
            prop_assert_eq!(drops, 0);
            for s in self.strong.iter().filter(|s| !s.is_empty()) {
                prop_assert_eq!(s.use_count(), live);
            }
        } else {
            self.ever_dead = true;
            prop_assert_eq!(drops, 1);
            for w in self.held_weak() {
                prop_assert!(w.lock().is_empty());
            }
        }
        for w in self.held_weak() {
            prop_assert_eq!(w.use_count(), live);
        }
        let block_gone = live == 0 && self.held_weak().next().is_none();
        let expected = usize::from(block_gone);
        prop_assert_eq!(finalized_blocks() - self.blocks_before, expected);
        Ok(())
    }
}

#[test]
fn downgrading_a_reset_handle_observes_nothing() {
    let mut world = World::new();
    let ops = [
        Op::Downgrade(0),
        Op::CloneStrong(0),
        Op::ResetStrong(0),
        Op::Lock(0),
        Op::Downgrade(3),
    ];
    for op in ops {
        world.apply(op);
        world.check().unwrap();
    }
    assert!(world.weak[1].ptr_eq(&WeakHandle::empty()));
    assert_eq!(world.weak[0].use_count(), 2);
}

proptest! {
    #[test]
    fn payload_and_block_finalized_exactly_once(ops in proptest::collection::vec(arb_op(), 0..64)) {
        let mut world = World::new();
        for op in ops {
            world.apply(op);
            world.check()?;
        }
        world.strong.clear();
        world.weak.clear();
        prop_assert_eq!(world.drops.load(Relaxed), 1);
        prop_assert_eq!(finalized_blocks() - world.blocks_before, 1);
    }

    #[test]
    fn empty_handles_never_touch_counters(resets in 1usize..8) {
        let drops = Arc::new(AtomicUsize::new(0));
        let keep = StrongHandle::new(DetectDrop(drops.clone()));
        let mut detached = keep.clone();
        detached.reset();
        let mut weak: WeakHandle<DetectDrop> = WeakHandle::empty();
        for _ in 0..resets {
            detached.reset();
            weak.reset();
            drop(StrongHandle::<DetectDrop>::empty());
            drop(WeakHandle::<DetectDrop>::empty());
        }
        prop_assert_eq!(keep.use_count(), 1);
        prop_assert_eq!(keep.weak_count(), 0);
        prop_assert_eq!(drops.load(Relaxed), 0);
    }
}
