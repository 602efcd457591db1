// Which side of the load statement a pipe endpoint can be acquired on.
use std::time::Duration;

use tracing::debug;

use super::{PipeEndpoint, PipeFactory};
use crate::core::error::{Error, ErrorKind};
use crate::core::sql::{self, StatementExecutor};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallStrategy {
    /// The pipe must exist before the load statement runs (unix FIFOs).
    CreateBeforeLoad,
    /// The load statement creates the server pipe; connect afterwards (native pipes).
    CreateAfterLoad,
}

#[derive(Debug)]
pub enum Acquired {
    Stream(PipeEndpoint),
    None,
}

impl Acquired {
    pub fn into_stream(self) -> Option<PipeEndpoint> {
        match self {
            Self::Stream(endpoint) => Some(endpoint),
            Self::None => None,
        }
    }
}

impl CallStrategy {
    pub fn before_execute_create(&self, factory: &PipeFactory, name: &str) -> Result<Acquired, Error> {
        match self {
            Self::CreateBeforeLoad => {
                debug!(pipe = name, "acquiring pipe before load");
                Ok(Acquired::Stream(factory.open(name)?))
            }
            Self::CreateAfterLoad => Ok(Acquired::None),
        }
    }

    pub fn after_execute_create(&self, factory: &PipeFactory, name: &str) -> Result<Acquired, Error> {
        match self {
            Self::CreateBeforeLoad => Ok(Acquired::None),
            Self::CreateAfterLoad => {
                debug!(pipe = name, "acquiring pipe after load");
                Ok(Acquired::Stream(factory.open(name)?))
            }
        }
    }

    /// Acquires through whichever phase yields a stream, for callers with no statement to run.
    pub fn acquire(&self, factory: &PipeFactory, name: &str) -> Result<PipeEndpoint, Error> {
        match self.before_execute_create(factory, name)? {
            Acquired::Stream(endpoint) => Ok(endpoint),
            Acquired::None => match self.after_execute_create(factory, name)? {
                Acquired::Stream(endpoint) => Ok(endpoint),
                Acquired::None => Err(Error::new(ErrorKind::Internal)
                    .with_message("call strategy yielded no pipe in either phase")),
            },
        }
    }

    /// Session settings the database needs right before the load statement.
    pub fn setup_for_load(&self, executor: &dyn StatementExecutor, timeout: Duration) -> Result<(), Error> {
        match self {
            Self::CreateBeforeLoad => Ok(()),
            Self::CreateAfterLoad => {
                executor.execute(sql::pipe_mode_server())?;
                executor.execute(&sql::pipe_timeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipe::native::test_backend::TestBackend;
    use crate::core::pipe::native::{NativePipeBackend, NativeRole, RetryPolicy};
    use crate::core::pipe::{NativePipe, OsNativePipeBackend, Platform};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl StatementExecutor for Recorder {
        fn execute(&self, sql: &str) -> Result<(), Error> {
            self.0.lock().unwrap_or_else(|p| p.into_inner()).push(sql.to_string());
            Ok(())
        }

        fn cancel(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    #[cfg(unix)]
    #[test]
    fn unix_acquires_before_and_not_after() {
        let dir = tempfile::tempdir().expect("tempdir");
        let factory = PipeFactory::local_with(Platform::Unix, dir.path(), Arc::new(OsNativePipeBackend));
        let strategy = factory.strategy();
        let mut endpoint = strategy
            .before_execute_create(&factory, "u1")
            .expect("before")
            .into_stream()
            .expect("stream");
        assert!(dir.path().join("u1").exists());
        assert!(matches!(
            strategy.after_execute_create(&factory, "u1").expect("after"),
            Acquired::None
        ));
        endpoint.discard();
    }

    #[test]
    fn native_acquires_after_only() {
        let backend = TestBackend::default();
        let shared: Arc<dyn NativePipeBackend> = Arc::new(backend);
        // The database side creates the server pipe when the load statement runs.
        let mut server = NativePipe::new("w1", NativeRole::Server, Arc::clone(&shared));
        server.connect().expect("server");

        let factory = PipeFactory::local_with(Platform::Windows, "/unused", shared).with_retry(RetryPolicy {
            attempts: 2,
            delay: Duration::from_millis(1),
        });
        let strategy = factory.strategy();
        assert!(matches!(
            strategy.before_execute_create(&factory, "w1").expect("before"),
            Acquired::None
        ));
        let acquired = strategy.after_execute_create(&factory, "w1").expect("after");
        assert!(matches!(acquired, Acquired::Stream(PipeEndpoint::Native(_))));
    }

    #[test]
    fn native_acquire_failure_is_transport_error() {
        let factory = PipeFactory::local_with(Platform::Windows, "/unused", Arc::new(TestBackend::default()))
            .with_retry(RetryPolicy {
                attempts: 2,
                delay: Duration::from_millis(1),
            });
        let err = factory.strategy().acquire(&factory, "nobody").expect_err("no server");
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn setup_sets_pipe_mode_only_for_native_pipes() {
        let recorder = Recorder::default();
        CallStrategy::CreateBeforeLoad
            .setup_for_load(&recorder, Duration::from_secs(15))
            .expect("unix");
        assert!(recorder.0.lock().expect("lock").is_empty());

        CallStrategy::CreateAfterLoad
            .setup_for_load(&recorder, Duration::from_secs(15))
            .expect("native");
        assert_eq!(
            *recorder.0.lock().expect("lock"),
            vec![
                "set @bh_pipemode='server';".to_string(),
                "set @bh_timeout=15;".to_string()
            ]
        );
    }
}
