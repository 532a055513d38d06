use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use launch::{launch, DistUrl, LaunchError, LaunchSpec, WorkerBootstrap, WorkerInfo};
use tracing_subscriber::fmt::MakeWriter;

const ADVISORY: &str = "file:// is not a reliable init_method";

/// Log sink shared between the subscriber and the test.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Captured {
    type Writer = Captured;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

struct NoopBootstrap;

impl WorkerBootstrap for NoopBootstrap {
    fn run<A, R, E, F>(&self, _worker: WorkerInfo, _main_func: F, _args: A) -> Result<(), E>
    where
        F: FnOnce(A) -> Result<R, E>,
        E: From<LaunchError>,
    {
        Ok(())
    }
}

fn with_captured_logs(body: impl FnOnce()) -> String {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(captured.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    tracing::subscriber::with_default(subscriber, body);
    captured.text()
}

fn multi_machine_file_spec() -> LaunchSpec {
    LaunchSpec {
        num_machines: 2,
        dist_url: Some(DistUrl::File(PathBuf::from("/shared/rdzv"))),
        ..LaunchSpec::new(2)
    }
}

#[test]
fn file_url_across_machines_warns_once_per_launch() {
    let logs = with_captured_logs(|| {
        let mut spec = multi_machine_file_spec();
        // A spawning parent resolves the URL itself before launching.
        let url = spec.resolve_dist_url().unwrap();
        spec.dist_url = Some(url);
        launch(
            |_: ()| -> Result<(), LaunchError> { Ok(()) },
            &spec,
            (),
            &NoopBootstrap,
        )
        .unwrap();
    });
    assert_eq!(logs.matches(ADVISORY).count(), 1, "{logs}");
    assert!(logs.contains("WARN"), "{logs}");
}

#[test]
fn single_machine_file_url_does_not_warn() {
    let logs = with_captured_logs(|| {
        let spec = LaunchSpec {
            num_machines: 1,
            ..multi_machine_file_spec()
        };
        launch(
            |_: ()| -> Result<(), LaunchError> { Ok(()) },
            &spec,
            (),
            &NoopBootstrap,
        )
        .unwrap();
    });
    assert!(!logs.contains(ADVISORY), "{logs}");
}
