use crate::backup_error::BackupError;
use std::process::{Command, Stdio};

/// Exit status and collected stderr of the consumer end of a pipe.
#[derive(Debug, PartialEq, Clone)]
pub struct PipeStatus {
    pub code: i32,
    pub stderr: String,
}

impl PipeStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

pub trait Exec {
    /// Runs a command and returns its standard output
    ///
    /// * `argv` - program name followed by its arguments
    ///
    fn run(&mut self, argv: &[String]) -> Result<String, BackupError>;

    /// Runs a producer command with its standard output connected to the
    /// standard input of a consumer command, waits for the consumer and
    /// returns its exit status together with its standard error
    ///
    /// * `producer` - argument vector of the producing command
    /// * `consumer` - argument vector of the consuming command
    ///
    fn run_piped(&mut self, producer: &[String], consumer: &[String])
        -> Result<PipeStatus, BackupError>;
}

pub struct CommandExec;

impl Exec for CommandExec {
    fn run(&mut self, argv: &[String]) -> Result<String, BackupError> {
        let (program, args) = split_argv(argv)?;

        log::debug!("running: {}", argv.join(" "));

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?
            .wait_with_output()?;

        match output.status.code() {
            Some(0) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
            Some(code) => Err(BackupError::Command {
                code,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            None => Err(BackupError::Signaled),
        }
    }

    fn run_piped(
        &mut self,
        producer: &[String],
        consumer: &[String],
    ) -> Result<PipeStatus, BackupError> {
        let (producer_program, producer_args) = split_argv(producer)?;
        let (consumer_program, consumer_args) = split_argv(consumer)?;

        log::debug!("piping: {} | {}", producer.join(" "), consumer.join(" "));

        let mut first = Command::new(producer_program)
            .args(producer_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let first_stdout = first
            .stdout
            .take()
            .ok_or(BackupError::Transfer(String::from(
                "no output handle on producing command",
            )))?;

        // The pipe handed to the consumer is a plain blocking OS pipe.
        let second = Command::new(consumer_program)
            .args(consumer_args)
            .stdin(Stdio::from(first_stdout))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let output = second.wait_with_output()?;
        let _ = first.wait();

        match output.status.code() {
            Some(code) => Ok(PipeStatus {
                code,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            None => Err(BackupError::Signaled),
        }
    }
}

fn split_argv(argv: &[String]) -> Result<(&String, &[String]), BackupError> {
    argv.split_first()
        .ok_or(BackupError::Transfer(String::from("empty argument vector")))
}

#[cfg(test)]
mockall::mock! {
    pub Exec {}
    impl Exec for Exec {
        fn run(&mut self, argv: &[String]) -> Result<String, BackupError>;
        fn run_piped(&mut self, producer: &[String], consumer: &[String])
            -> Result<PipeStatus, BackupError>;
    }
}
