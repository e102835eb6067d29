// tests/common.rs
#![allow(dead_code)] // Not every test binary uses every fixture.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use troupe::{Director, MethodTable, Performer, StopReason, Value, ValueKind};

static TRACING_INIT: Once = Once::new();

/// Initializes the tracing subscriber once per test binary. Override the
/// filter with RUST_LOG.
pub fn setup_tracing() {
  TRACING_INIT.call_once(|| {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("troupe=debug,warn"));
    let subscriber = FmtSubscriber::builder()
      .with_env_filter(env_filter)
      .with_target(true)
      .with_test_writer()
      .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");
  });
}

/// Binds a director on a free loopback port.
pub async fn test_director() -> Director {
  setup_tracing();
  let node = troupe::free_local_node().expect("no free port");
  Director::bind(node).await.expect("failed to bind director")
}

/// The phone book from the examples: a name → number mapping where adding
/// the number 2344 panics, which the remote scenarios use to kill the actor
/// mid-stream.
pub struct Phonebook {
  pub book: HashMap<String, i64>,
  pub terminations: Arc<Mutex<Vec<String>>>,
}

impl Phonebook {
  pub fn new() -> Self {
    Self {
      book: HashMap::new(),
      terminations: Arc::new(Mutex::new(Vec::new())),
    }
  }
}

pub static PHONEBOOK_METHODS: Lazy<MethodTable> = Lazy::new(|| {
  MethodTable::for_type::<Phonebook>("Phonebook")
    .method("add", &[ValueKind::Str, ValueKind::Int], |b, args| {
      let name = args[0].as_str().expect("verified").to_string();
      let number = args[1].as_int().expect("verified");
      if number == 2344 {
        panic!("haha panic!");
      }
      b.book.insert(name, number);
      vec![]
    })
    .method("lookup", &[ValueKind::Str], |b, args| {
      match b.book.get(args[0].as_str().expect("verified")) {
        Some(number) => vec![Value::Int(*number), Value::Bool(true)],
        None => vec![Value::Int(0), Value::Bool(false)],
      }
    })
    .build()
});

impl Performer for Phonebook {
  fn methods(&self) -> &'static MethodTable {
    &PHONEBOOK_METHODS
  }

  fn terminate(&mut self, reason: &StopReason) {
    tracing::info!(%reason, "phonebook terminated");
    self.terminations.lock().push(reason.to_string());
  }
}

/// Records what the termination hook observed: `Ok(())` for a deliberate
/// stop, otherwise the panic payload downcast to an integer.
pub type HookLog = Arc<Mutex<Vec<Result<(), Option<i64>>>>>;

/// An actor whose only method panics with the value of its `y` field.
pub struct PanicProbe {
  pub y: i64,
  pub hook: HookLog,
}

pub static PANIC_PROBE_METHODS: Lazy<MethodTable> = Lazy::new(|| {
  MethodTable::for_type::<PanicProbe>("PanicProbe")
    .method("do_panic", &[], |p, _| std::panic::panic_any(p.y))
    .build()
});

impl Performer for PanicProbe {
  fn methods(&self) -> &'static MethodTable {
    &PANIC_PROBE_METHODS
  }

  fn terminate(&mut self, reason: &StopReason) {
    let entry = match reason {
      StopReason::Stopped => Ok(()),
      StopReason::Panicked(cause) => Err(cause.payload().downcast_ref::<i64>().copied()),
    };
    self.hook.lock().push(entry);
  }
}

/// An actor that sleeps through its deadline unless told otherwise.
pub struct Sleeper;

pub static SLEEPER_METHODS: Lazy<MethodTable> = Lazy::new(|| {
  MethodTable::for_type::<Sleeper>("Sleeper")
    .method("nap", &[ValueKind::Context, ValueKind::Int], |_, args| {
      let millis = args[1].as_int().expect("verified");
      std::thread::sleep(Duration::from_millis(millis as u64));
      vec![Value::Bool(args[0].as_context().expect("verified").expired())]
    })
    .build()
});

impl Performer for Sleeper {
  fn methods(&self) -> &'static MethodTable {
    &SLEEPER_METHODS
  }

  fn terminate(&mut self, _reason: &StopReason) {}
}

/// Observes whether two method bodies ever overlap.
pub struct Overlap {
  pub busy: Arc<AtomicBool>,
  pub overlapped: Arc<AtomicBool>,
  pub entered: Arc<AtomicUsize>,
}

impl Overlap {
  pub fn new() -> Self {
    Self {
      busy: Arc::new(AtomicBool::new(false)),
      overlapped: Arc::new(AtomicBool::new(false)),
      entered: Arc::new(AtomicUsize::new(0)),
    }
  }
}

pub static OVERLAP_METHODS: Lazy<MethodTable> = Lazy::new(|| {
  MethodTable::for_type::<Overlap>("Overlap")
    .method("occupy", &[], |o, _| {
      if o.busy.swap(true, Ordering::SeqCst) {
        o.overlapped.store(true, Ordering::SeqCst);
      }
      std::thread::sleep(Duration::from_millis(5));
      o.busy.store(false, Ordering::SeqCst);
      o.entered.fetch_add(1, Ordering::SeqCst);
      vec![]
    })
    .build()
});

impl Performer for Overlap {
  fn methods(&self) -> &'static MethodTable {
    &OVERLAP_METHODS
  }

  fn terminate(&mut self, _reason: &StopReason) {}
}
