use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dotenv::dotenv;
use parking_lot::Mutex;
use playmind::agents::{EnvConfig, TargetSeekEnv, TrainingMetrics};
use playmind::{AgentConfig, PolicyAgent, ReplayStore, ValueAgent};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn get_env_var_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|val| val.parse::<usize>().ok())
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("playmind=debug,info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .finish();

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install tracing subscriber: {}", err);
    }
}

/// Play episodes against the toy environment, alternating agents per episode
fn run_episodes(
    episodes: usize,
    env_config: EnvConfig,
    value: Arc<ValueAgent>,
    policy: Arc<PolicyAgent>,
    metrics: Arc<Mutex<TrainingMetrics>>,
) {
    let mut env = TargetSeekEnv::new(env_config);

    for episode in 0..episodes {
        let mut obs = env.reset();
        let mut total_reward = 0.0;
        let use_value = episode % 2 == 0;

        loop {
            let action = if use_value {
                value.select_action(&obs)
            } else {
                policy.select_action(&obs)
            };
            let result = env.step(action);
            total_reward += result.reward;

            if use_value {
                let outcome =
                    value.record_and_learn(&obs, action, result.reward, &result.observation, result.done);
                metrics.lock().record_learn(&outcome);
            } else {
                if let Err(err) =
                    policy.record_experience(&obs, action, result.reward, &result.observation, result.done)
                {
                    tracing::warn!("Dropped policy transition: {}", err);
                }
                metrics.lock().total_steps += 1;
            }

            obs = result.observation;
            if result.done || result.truncated {
                metrics
                    .lock()
                    .record_episode(total_reward, result.info.steps, result.info.reached_target);
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_logging();

    let config = AgentConfig::load()?;
    let episodes = get_env_var_usize("PLAYMIND_EPISODES").unwrap_or(200);
    let train_interval =
        Duration::from_millis(get_env_var_usize("PLAYMIND_TRAIN_INTERVAL_MS").unwrap_or(20) as u64);

    tracing::info!(
        "Starting: {} episodes, {} states -> {} actions, {:?} backend",
        episodes,
        config.value.state_size,
        config.value.action_size,
        config.value.backend
    );

    let replay = Arc::new(ReplayStore::new(config.replay.clone())?);
    let value = Arc::new(ValueAgent::new(config.value.clone(), Arc::clone(&replay))?);
    let policy = Arc::new(PolicyAgent::new(config.policy.clone(), Arc::clone(&replay))?);
    let metrics = Arc::new(Mutex::new(TrainingMetrics::default()));
    let running = Arc::new(AtomicBool::new(true));

    let trainer = {
        let value = Arc::clone(&value);
        let policy = Arc::clone(&policy);
        let replay = Arc::clone(&replay);
        let metrics = Arc::clone(&metrics);
        let running = Arc::clone(&running);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(train_interval);
            let mut ticks: u64 = 0;
            while running.load(Ordering::Acquire) {
                ticker.tick().await;
                ticks += 1;

                let value_outcome = value.train_step();
                let policy_outcome = policy.train_step();
                {
                    let mut metrics = metrics.lock();
                    metrics.record_train(&value_outcome);
                    metrics.record_train(&policy_outcome);
                }
                if ticks % 50 == 0 {
                    value.sync_target();
                }
                if let Some(reclaimed) = replay.maybe_compact() {
                    tracing::debug!("Compaction reclaimed {} allocations", reclaimed);
                }
                if ticks % 250 == 0 {
                    metrics.lock().log_to_console();
                }
            }
        })
    };

    let env_config = EnvConfig {
        state_size: config.value.state_size,
        ..EnvConfig::default()
    };
    let game_loop = {
        let value = Arc::clone(&value);
        let policy = Arc::clone(&policy);
        let metrics = Arc::clone(&metrics);
        tokio::task::spawn_blocking(move || {
            run_episodes(episodes, env_config, value, policy, metrics)
        })
    };

    game_loop.await?;
    running.store(false, Ordering::Release);
    trainer.await?;

    metrics.lock().log_to_console();
    tracing::info!("Value agent: {:?}", value.stats());
    tracing::info!("Policy agent: {:?}", policy.stats());
    tracing::info!("Replay store: {:?}", replay.stats());

    value.save("models")?;
    policy.save("models")?;

    value.cleanup();
    policy.cleanup();
    replay.clear();

    Ok(())
}
