use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use deskhive_common::VmState;

use crate::context::Ctx;
use crate::{create_flow, delete_flow, reboot_flow, resize_flow};

/// What happens to the backing volume once its instance is confirmed gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AfterTeardown {
    DeleteVolume,
    ShelveVolume,
}

/// One schedulable workflow step. Every step carries everything it needs to
/// resume statelessly: the payload rides through the durable task queue as
/// tagged JSON, so a crash between steps loses nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum WorkflowStep {
    // Create / unshelve
    CreateVolume {
        vm_status_id: i64,
        username: String,
        desktop_type: String,
        zone: String,
        unshelve: bool,
    },
    WaitVolumeAvailable {
        vm_status_id: i64,
        volume_id: Uuid,
        desktop_type: String,
        started: DateTime<Utc>,
        unshelve: bool,
    },
    WaitInstanceActive {
        vm_status_id: i64,
        instance_id: Uuid,
        desktop_type: String,
        started: DateTime<Utc>,
        unshelve: bool,
    },

    // Teardown (delete / shelve)
    StopAndRelease {
        instance_id: Uuid,
        after: AfterTeardown,
    },
    WaitShutoff {
        instance_id: Uuid,
        retries: i32,
        after: AfterTeardown,
    },
    ConfirmInstanceGone {
        instance_id: Uuid,
        retries: i32,
        after: AfterTeardown,
    },
    DeleteVolume {
        volume_id: Uuid,
    },

    // Archive
    WaitBackup {
        volume_id: Uuid,
        backup_id: String,
        deadline: DateTime<Utc>,
    },

    // Resize
    StartResize {
        instance_id: Uuid,
        target_flavor: String,
        target_state: VmState,
        boost: bool,
    },
    WaitResizeConfirm {
        instance_id: Uuid,
        target_flavor: String,
        target_state: VmState,
        deadline: DateTime<Utc>,
    },

    // Reboot
    Reboot {
        instance_id: Uuid,
        hard: bool,
    },
    WaitRebootActive {
        instance_id: Uuid,
        retries: i32,
    },
}

impl WorkflowStep {
    /// Short tag for logs.
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowStep::CreateVolume { .. } => "create_volume",
            WorkflowStep::WaitVolumeAvailable { .. } => "wait_volume_available",
            WorkflowStep::WaitInstanceActive { .. } => "wait_instance_active",
            WorkflowStep::StopAndRelease { .. } => "stop_and_release",
            WorkflowStep::WaitShutoff { .. } => "wait_shutoff",
            WorkflowStep::ConfirmInstanceGone { .. } => "confirm_instance_gone",
            WorkflowStep::DeleteVolume { .. } => "delete_volume",
            WorkflowStep::WaitBackup { .. } => "wait_backup",
            WorkflowStep::StartResize { .. } => "start_resize",
            WorkflowStep::WaitResizeConfirm { .. } => "wait_resize_confirm",
            WorkflowStep::Reboot { .. } => "reboot",
            WorkflowStep::WaitRebootActive { .. } => "wait_reboot_active",
        }
    }
}

/// Resume a persisted step by dispatching on its tag.
pub async fn dispatch(ctx: &Ctx, step: WorkflowStep) -> Result<()> {
    match step {
        WorkflowStep::CreateVolume {
            vm_status_id,
            username,
            desktop_type,
            zone,
            unshelve,
        } => {
            create_flow::create_volume_step(ctx, vm_status_id, &username, &desktop_type, &zone, unshelve)
                .await
        }
        WorkflowStep::WaitVolumeAvailable {
            vm_status_id,
            volume_id,
            desktop_type,
            started,
            unshelve,
        } => {
            create_flow::wait_volume_available(ctx, vm_status_id, volume_id, &desktop_type, started, unshelve)
                .await
        }
        WorkflowStep::WaitInstanceActive {
            vm_status_id,
            instance_id,
            desktop_type,
            started,
            unshelve,
        } => {
            create_flow::wait_instance_active(ctx, vm_status_id, instance_id, &desktop_type, started, unshelve)
                .await
        }
        WorkflowStep::StopAndRelease { instance_id, after } => {
            delete_flow::stop_and_release(ctx, instance_id, after).await
        }
        WorkflowStep::WaitShutoff {
            instance_id,
            retries,
            after,
        } => delete_flow::wait_shutoff(ctx, instance_id, retries, after).await,
        WorkflowStep::ConfirmInstanceGone {
            instance_id,
            retries,
            after,
        } => delete_flow::confirm_instance_gone(ctx, instance_id, retries, after).await,
        WorkflowStep::DeleteVolume { volume_id } => {
            delete_flow::delete_volume(ctx, volume_id).await.map(|_| ())
        }
        WorkflowStep::WaitBackup {
            volume_id,
            backup_id,
            deadline,
        } => delete_flow::wait_backup(ctx, volume_id, &backup_id, deadline).await,
        WorkflowStep::StartResize {
            instance_id,
            target_flavor,
            target_state,
            boost,
        } => resize_flow::start_resize(ctx, instance_id, &target_flavor, target_state, boost).await,
        WorkflowStep::WaitResizeConfirm {
            instance_id,
            target_flavor,
            target_state,
            deadline,
        } => {
            resize_flow::wait_resize_confirm(ctx, instance_id, &target_flavor, target_state, deadline)
                .await
        }
        WorkflowStep::Reboot { instance_id, hard } => {
            reboot_flow::reboot(ctx, instance_id, hard).await
        }
        WorkflowStep::WaitRebootActive {
            instance_id,
            retries,
        } => reboot_flow::wait_reboot_active(ctx, instance_id, retries).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_round_trip_through_tagged_json() {
        let steps = vec![
            WorkflowStep::CreateVolume {
                vm_status_id: 7,
                username: "alice".to_string(),
                desktop_type: "ubuntu".to_string(),
                zone: "melbourne".to_string(),
                unshelve: false,
            },
            WorkflowStep::WaitShutoff {
                instance_id: Uuid::new_v4(),
                retries: 8,
                after: AfterTeardown::ShelveVolume,
            },
            WorkflowStep::WaitBackup {
                volume_id: Uuid::new_v4(),
                backup_id: "backup-1".to_string(),
                deadline: Utc::now(),
            },
            WorkflowStep::StartResize {
                instance_id: Uuid::new_v4(),
                target_flavor: "m3.xlarge".to_string(),
                target_state: VmState::Supersized,
                boost: true,
            },
        ];
        for step in steps {
            let json = serde_json::to_value(&step).unwrap();
            // The tag is what the dispatcher switches on; it must be stable.
            assert_eq!(json["step"], step.name());
            let back: WorkflowStep = serde_json::from_value(json).unwrap();
            assert_eq!(back, step);
        }
    }

    #[test]
    fn unknown_step_tags_are_rejected() {
        let err = serde_json::from_value::<WorkflowStep>(
            serde_json::json!({"step": "defragment_everything"}),
        );
        assert!(err.is_err());
    }
}
