use crate::context::Ctx;
use crate::expirer::{
    self, BackupDeleteStrategy, ExpiryStrategy, InstanceShelveStrategy, ResizeDownsizeStrategy,
    VolumeArchiveStrategy,
};

/// job-expiry: periodically advances every active Expiration through the
/// notify-then-act state machine. Each pass walks the four retirement
/// strategies; everything not yet due is a cheap skip.
pub async fn run(ctx: Ctx) {
    let mut interval = tokio::time::interval(ctx.settings.expiry_pass_interval);
    tracing::info!(
        "job-expiry started (pass every {:?}{})",
        ctx.settings.expiry_pass_interval,
        if ctx.settings.expiry_dry_run {
            ", dry-run"
        } else {
            ""
        }
    );

    loop {
        interval.tick().await;
        run_pass(&ctx).await;
    }
}

pub async fn run_pass(ctx: &Ctx) {
    let strategies: [&dyn ExpiryStrategy; 4] = [
        &InstanceShelveStrategy,
        &VolumeArchiveStrategy,
        &BackupDeleteStrategy,
        &ResizeDownsizeStrategy,
    ];
    for strategy in strategies {
        match expirer::run_strategy(ctx, strategy).await {
            Ok((notified, expired)) if notified + expired > 0 => {
                tracing::info!(
                    "job-expiry {}: {} notified, {} expired",
                    strategy.name(),
                    notified,
                    expired
                );
            }
            Ok(_) => {}
            Err(e) => tracing::error!("job-expiry {} pass failed: {:?}", strategy.name(), e),
        }
    }
}
