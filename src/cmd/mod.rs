use anyhow::Result;
use async_trait::async_trait;

pub mod close;
pub mod configure;
pub mod plan;
pub mod provision;

#[async_trait]
pub trait Command {
    async fn run(&self) -> Result<()>;
}

pub trait IntoCommand {
    fn into_command(self) -> Box<dyn Command>;
}

impl IntoCommand for crate::cli::Command {
    fn into_command(self) -> Box<dyn Command> {
        match self {
            crate::cli::Command::Provision(provision_options) => {
                Box::new(provision::ProvisionCommand { provision_options })
            }
            crate::cli::Command::Configure(configure_options) => {
                Box::new(configure::ConfigureCommand { configure_options })
            }
            crate::cli::Command::Close(close_options) => {
                Box::new(close::CloseCommand { close_options })
            }
            crate::cli::Command::Plan(plan_options) => Box::new(plan::PlanCommand { plan_options }),
        }
    }
}
