//! Full update cycles driven through two runtime instances, the way the
//! driver runs them: cold start, handoff, resume, completion.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use moult_primitives::{Addr, Qualifiers};
use moult_runtime::{ControlTransfer, Handoff, Options, ResumeArgs, Runtime};
use moult_transform::{Env, Session};

fn catch_handoff(f: impl FnOnce()) -> Handoff {
	let payload = panic::catch_unwind(AssertUnwindSafe(f)).expect_err("update point must hand off");
	match payload.downcast::<ControlTransfer>() {
		Ok(transfer) => transfer.0,
		Err(other) => panic::resume_unwind(other),
	}
}

fn resume_from(handoff: Handoff) -> Arc<Runtime> {
	Runtime::resume(
		ResumeArgs {
			point: handoff.point,
			state: handoff.state,
			previous: None,
		},
		Options::default(),
	)
}

fn add_five(_: &mut Session, _: &Env<'_>, old: Addr, new: Addr) {
	let v = unsafe { *old.as_ptr::<u64>() } + 5;
	unsafe { *new.as_mut_ptr::<u64>() = v };
}

static HOOK_RUNS: AtomicUsize = AtomicUsize::new(0);

#[test]
fn global_counter_gains_five_across_an_update() {
	let v1 = Runtime::cold_start(Options::default());
	let counter_v1 = Box::new(100u64);
	v1.register_var(Qualifiers::global("counter"), Addr::of_ref(&*counter_v1), 8, true);
	v1.request_update();
	let handoff = catch_handoff(|| v1.update_point("main_loop"));
	assert_eq!(handoff.point, "main_loop");

	let v2 = resume_from(handoff);
	assert!(v2.has_updated());
	assert!(v2.is_updating_from("main_loop"));
	v2.register_transformer("counter", add_five);
	v2.set_main_update_hook(|_| {
		HOOK_RUNS.fetch_add(1, Ordering::SeqCst);
	});

	let counter_v2 = Box::new(0u64);
	v2.register_var(Qualifiers::global("counter"), Addr::of_ref(&*counter_v2), 8, true);
	assert_eq!(*counter_v2, 105, "auto-migration ran the transformer");

	// Points other than the resume target pass through untouched.
	v2.update_point("idle_loop");
	assert!(v2.is_updating());

	v2.update_point("main_loop");
	assert!(!v2.is_updating());
	assert_eq!(HOOK_RUNS.load(Ordering::SeqCst), 1, "main update hook ran once");
	assert!(
		v2.old_lookup(&Qualifiers::global("counter")).is_none(),
		"old registry released after completion"
	);
	assert_eq!(*counter_v2, 105);
}

#[test]
fn renames_swap_two_globals() {
	let v1 = Runtime::cold_start(Options::default());
	let a_v1 = Box::new(1u64);
	let b_v1 = Box::new(2u64);
	v1.register_var(Qualifiers::global("alpha"), Addr::of_ref(&*a_v1), 8, true);
	v1.register_var(Qualifiers::global("beta"), Addr::of_ref(&*b_v1), 8, true);
	v1.request_update();
	let handoff = catch_handoff(|| v1.update_point("main_loop"));

	let v2 = resume_from(handoff);
	// Each new name pulls the *other* old variable; both reads hit the old
	// snapshot, so registration order does not matter.
	v2.register_rename("alpha", "beta");
	v2.register_rename("beta", "alpha");

	let a_v2 = Box::new(0u64);
	let b_v2 = Box::new(0u64);
	v2.register_var(Qualifiers::global("alpha"), Addr::of_ref(&*a_v2), 8, true);
	v2.register_var(Qualifiers::global("beta"), Addr::of_ref(&*b_v2), 8, true);
	assert_eq!(*a_v2, 2);
	assert_eq!(*b_v2, 1);

	v2.update_point("main_loop");
	assert!(!v2.is_updating());
}

#[test]
fn relocated_locals_survive_into_the_next_version() {
	let v1 = Runtime::cold_start(Options::default());
	v1.enter("serve");
	let q = 400u32;
	v1.local("q", Addr::of_ref(&q), 4);
	v1.request_update();
	let handoff = catch_handoff(|| v1.update_point("serve_loop"));

	let v2 = resume_from(handoff);
	v2.enter("serve");
	let mut q_new = 0u32;
	assert!(v2.migrate(&Qualifiers::local("serve", "q"), Addr::of_mut(&mut q_new), 4));
	assert_eq!(q_new, 400);

	v2.update_point("serve_loop");
	assert!(v2.old_lookup(&Qualifiers::local("serve", "q")).is_none());
	v2.exit("serve");
}

static CURRENT_RT: Mutex<Option<Arc<Runtime>>> = Mutex::new(None);
static NEW_VERSION_TICKS: AtomicUsize = AtomicUsize::new(0);

fn pump(_: Addr) {
	loop {
		let rt = CURRENT_RT.lock().unwrap().clone().expect("runtime installed");
		rt.update_point("pump");
		if rt.has_updated() {
			NEW_VERSION_TICKS.fetch_add(1, Ordering::SeqCst);
		}
		rt.sleep_ms("pump", 5);
	}
}

#[test]
fn workers_quiesce_and_restart_in_the_new_version() {
	let v1 = Runtime::cold_start(Options::default());
	*CURRENT_RT.lock().unwrap() = Some(Arc::clone(&v1));
	v1.register_function(Qualifiers::global("pump"), pump);
	v1.spawn_worker(pump, Addr::NULL).unwrap();
	thread::sleep(Duration::from_millis(20));

	v1.request_update();
	let handoff = catch_handoff(|| v1.update_point("main_loop"));

	let v2 = resume_from(handoff);
	*CURRENT_RT.lock().unwrap() = Some(Arc::clone(&v2));
	v2.register_function(Qualifiers::global("pump"), pump);
	v2.update_point("main_loop");
	assert!(!v2.is_updating());

	while NEW_VERSION_TICKS.load(Ordering::SeqCst) == 0 {
		thread::sleep(Duration::from_millis(5));
	}

	// Wind the worker down through a second update request.
	v2.request_update();
	let final_handoff = catch_handoff(|| v2.update_point("main_loop"));
	assert_eq!(final_handoff.point, "main_loop");
}
