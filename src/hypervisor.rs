use crate::backup_error::BackupError;
use crate::config::XenConfig;
use crate::exec::Exec;

/// Pause and unpause of a guest around the snapshot point.
pub trait Hypervisor {
    fn quiesce(&mut self, guest: &str) -> Result<(), BackupError>;
    fn resume(&mut self, guest: &str) -> Result<(), BackupError>;
}

/// Hypervisor control through the `xe` command line client.
pub struct XeCli {
    master: String,
    user: String,
    password: String,
    exec: Box<dyn Exec>,
}

impl XeCli {
    pub fn new(config: &XenConfig, exec: Box<dyn Exec>) -> Self {
        XeCli {
            master: config.master.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            exec,
        }
    }

    fn power_args(&self, operation: &str, guest: &str) -> Vec<String> {
        vec![
            String::from("xe"),
            String::from("-s"),
            self.master.clone(),
            String::from("-u"),
            self.user.clone(),
            String::from("-pw"),
            self.password.clone(),
            operation.to_string(),
            format!("name-label={}", guest),
        ]
    }
}

impl Hypervisor for XeCli {
    fn quiesce(&mut self, guest: &str) -> Result<(), BackupError> {
        log::info!("pausing guest \"{}\"", guest);

        self.exec
            .run(&self.power_args("vm-pause", guest))
            .map(|_| ())
            .map_err(|e| BackupError::Quiesce(e.to_string()))
    }

    fn resume(&mut self, guest: &str) -> Result<(), BackupError> {
        log::info!("unpausing guest \"{}\"", guest);

        self.exec
            .run(&self.power_args("vm-unpause", guest))
            .map(|_| ())
            .map_err(|e| BackupError::Quiesce(e.to_string()))
    }
}

#[cfg(test)]
mockall::mock! {
    pub Hypervisor {}
    impl Hypervisor for Hypervisor {
        fn quiesce(&mut self, guest: &str) -> Result<(), BackupError>;
        fn resume(&mut self, guest: &str) -> Result<(), BackupError>;
    }
}
