//! The single active-loop branch tracker.

/// State of the innermost loop currently being tracked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveLoop {
    /// Address of the branch instruction that defines the loop.
    pub branch: u64,
    /// Address the branch jumps back to.
    pub target: u64,
    /// Number of times the branch has been observed taken.
    pub iterations: u64,
}

/// Tracks at most one loop at a time, driven by every evaluated loop-like branch
/// (conditional jumps, LOOP-family jumps, and jump-if-counter-zero).
///
/// The tracked state is advisory: branch outcomes are never overridden, but the information
/// is available to heuristics and to callers inspecting a finished run.
#[derive(Default, Clone, Copy, Debug)]
pub struct LoopTracker {
    active: Option<ActiveLoop>,
}
impl LoopTracker {
    /// The currently tracked loop, if any.
    pub fn current(&self) -> Option<ActiveLoop> {
        self.active
    }

    /// Feeds one evaluated branch into the state machine.
    /// `branch` is the address of the branch instruction itself, `target` its destination.
    pub fn observe(&mut self, branch: u64, target: u64, taken: bool) {
        let backward = target < branch;
        if backward {
            if taken {
                match &mut self.active {
                    // one more trip around the tracked loop
                    Some(lp) if lp.branch == branch => lp.iterations += 1,
                    // a different backward branch: the innermost active loop wins
                    _ => self.active = Some(ActiveLoop { branch, target, iterations: 1 }),
                }
            } else if matches!(self.active, Some(lp) if lp.branch == branch) {
                // the tracked loop fell through: it is done
                self.active = None;
            }
        } else if taken {
            if let Some(lp) = self.active {
                // a forward branch out of the loop body is a loop-breaking jump;
                // one landing inside the body is just an inner conditional
                if target < lp.target || target > lp.branch {
                    self.active = None;
                }
            }
        }
    }
}

#[test]
fn test_loop_lifecycle() {
    let mut t = LoopTracker::default();
    assert!(t.current().is_none());

    // four taken iterations, then the exit
    for i in 1..=4 {
        t.observe(0x120, 0x100, true);
        assert_eq!(t.current().unwrap().iterations, i);
    }
    t.observe(0x120, 0x100, false);
    assert!(t.current().is_none());
}

#[test]
fn test_nested_loop_replaces() {
    let mut t = LoopTracker::default();
    t.observe(0x150, 0x100, true);
    t.observe(0x130, 0x110, true); // inner loop takes over
    let lp = t.current().unwrap();
    assert_eq!((lp.branch, lp.target, lp.iterations), (0x130, 0x110, 1));

    // a not-taken backward branch that is not the tracked one changes nothing
    t.observe(0x150, 0x100, false);
    assert!(t.current().is_some());
}

#[test]
fn test_forward_branches() {
    let mut t = LoopTracker::default();
    t.observe(0x140, 0x100, true);

    // forward branch inside [target, branch] is an inner conditional
    t.observe(0x110, 0x120, true);
    assert!(t.current().is_some());

    // forward branch past the loop body breaks the loop
    t.observe(0x110, 0x200, true);
    assert!(t.current().is_none());
}
