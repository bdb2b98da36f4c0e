//! Demo Plugins
//!
//! Small plugins used by the `courier` binary and as examples of the
//! [`Plugin`] trait.
//!
//! | Plugin    | Commands                                         |
//! |-----------|--------------------------------------------------|
//! | `led`     | `on()` `off()` `toggle()` `state()` `blink(on\|off)` |
//! | `echo`    | `echo(text)`                                     |
//! | `counter` | `inc()` `inc(n)` `get()` `reset()`               |

use std::fmt::Write;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::codec::{Command, ResponseBuffer};
use crate::debug::Category;
use crate::plugin::{Plugin, WorkerContext};

/// Worker that does nothing until the plugin is stopped.
pub async fn idle<P: Plugin>(mut ctx: WorkerContext<P>) {
    ctx.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// LED
// ─────────────────────────────────────────────────────────────────────────────

/// A light that can be switched, and blinks while `blink(on)` is set.
pub struct LedPlugin {
    lit: AtomicBool,
    blinking: AtomicBool,
    ticks: AtomicU64,
    tick: Duration,
}

impl LedPlugin {
    pub fn new(tick: Duration) -> Self {
        Self {
            lit: AtomicBool::new(false),
            blinking: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            tick,
        }
    }

    pub fn is_lit(&self) -> bool {
        self.lit.load(Ordering::SeqCst)
    }

    pub fn is_blinking(&self) -> bool {
        self.blinking.load(Ordering::SeqCst)
    }

    /// Number of worker ticks so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    fn toggle(&self) -> bool {
        !self.lit.fetch_xor(true, Ordering::SeqCst)
    }

    fn state_str(&self) -> &'static str {
        if self.is_lit() { "on" } else { "off" }
    }
}

impl Default for LedPlugin {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[async_trait]
impl Plugin for LedPlugin {
    async fn handle(&self, command: &Command, response: &mut ResponseBuffer) -> bool {
        match command.function() {
            "on" => {
                self.blinking.store(false, Ordering::SeqCst);
                self.lit.store(true, Ordering::SeqCst);
            }
            "off" => {
                self.blinking.store(false, Ordering::SeqCst);
                self.lit.store(false, Ordering::SeqCst);
            }
            "toggle" => {
                self.toggle();
            }
            "state" => {}
            "blink" => match command.parameters() {
                "on" | "" => self.blinking.store(true, Ordering::SeqCst),
                "off" => self.blinking.store(false, Ordering::SeqCst),
                other => {
                    let _ = write!(response, "invalid_parameter({})", other);
                    return true;
                }
            },
            _ => return false,
        }
        response.set(self.state_str());
        true
    }
}

/// Ticks at the LED's period, toggling the light while blinking.
pub async fn led_worker(mut ctx: WorkerContext<LedPlugin>) {
    let led = ctx.plugin().clone();
    let mut interval = tokio::time::interval(led.tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.shutdown() => break,
            _ = interval.tick() => {
                led.ticks.fetch_add(1, Ordering::SeqCst);
                if led.is_blinking() {
                    let lit = led.toggle();
                    let state = if lit { "on" } else { "off" };
                    ctx.log(3, Category::Debug, format_args!("blink {}", state));
                }
            }
        }
    }
    tracing::debug!(plugin = %ctx.name(), ticks = led.ticks(), "LED worker finished");
}

// ─────────────────────────────────────────────────────────────────────────────
// Echo
// ─────────────────────────────────────────────────────────────────────────────

/// Replies with the parameters of `echo(...)`.
#[derive(Debug, Default)]
pub struct EchoPlugin;

#[async_trait]
impl Plugin for EchoPlugin {
    async fn handle(&self, command: &Command, response: &mut ResponseBuffer) -> bool {
        if command.function() != "echo" {
            return false;
        }
        response.set(command.parameters());
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Counter
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct CounterPlugin {
    value: AtomicI64,
}

impl CounterPlugin {
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Plugin for CounterPlugin {
    async fn handle(&self, command: &Command, response: &mut ResponseBuffer) -> bool {
        let value = match command.function() {
            "inc" => {
                let step = match command.parameters() {
                    "" => 1,
                    text => match text.trim().parse::<i64>() {
                        Ok(step) => step,
                        Err(_) => {
                            let _ = write!(response, "invalid_parameter({})", text);
                            return true;
                        }
                    },
                };
                self.value.fetch_add(step, Ordering::SeqCst).wrapping_add(step)
            }
            "get" => self.value(),
            "reset" => {
                self.value.store(0, Ordering::SeqCst);
                0
            }
            _ => return false,
        };
        let _ = write!(response, "{}", value);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::directory::Directory;
    use crate::kernel::{ThreadKernel, TokioKernel};
    use crate::plugin::{PluginHost, StartOptions};

    const WAIT: Duration = Duration::from_secs(2);

    async fn ask(plugin: &impl Plugin, text: &str) -> Option<String> {
        let command = Command::parse(text).unwrap();
        let mut response = ResponseBuffer::default();
        plugin
            .handle(&command, &mut response)
            .await
            .then(|| response.as_str().to_string())
    }

    #[tokio::test]
    async fn test_led_commands() {
        let led = LedPlugin::default();
        assert_eq!(ask(&led, "state()").await.as_deref(), Some("off"));
        assert_eq!(ask(&led, "on()").await.as_deref(), Some("on"));
        assert_eq!(ask(&led, "toggle()").await.as_deref(), Some("off"));
        assert_eq!(ask(&led, "blink(on)").await.as_deref(), Some("off"));
        assert!(led.is_blinking());
        assert_eq!(
            ask(&led, "blink(fast)").await.as_deref(),
            Some("invalid_parameter(fast)")
        );
        assert_eq!(ask(&led, "dim()").await, None);
    }

    #[tokio::test]
    async fn test_counter_commands() {
        let counter = CounterPlugin::default();
        assert_eq!(ask(&counter, "inc()").await.as_deref(), Some("1"));
        assert_eq!(ask(&counter, "inc(5)").await.as_deref(), Some("6"));
        assert_eq!(ask(&counter, "inc(-2)").await.as_deref(), Some("4"));
        assert_eq!(
            ask(&counter, "inc(x)").await.as_deref(),
            Some("invalid_parameter(x)")
        );
        assert_eq!(ask(&counter, "get()").await.as_deref(), Some("4"));
        assert_eq!(ask(&counter, "reset()").await.as_deref(), Some("0"));
        assert_eq!(counter.value(), 0);
    }

    #[tokio::test]
    async fn test_echo_returns_parameters() {
        assert_eq!(ask(&EchoPlugin, "echo(hello)").await.as_deref(), Some("hello"));
        assert_eq!(ask(&EchoPlugin, "echo()").await.as_deref(), Some(""));
        assert_eq!(ask(&EchoPlugin, "shout(x)").await, None);
    }

    #[tokio::test]
    async fn test_led_worker_blinks_until_stopped() {
        let directory = Directory::new_shared(4);
        let led = PluginHost::new(
            "led",
            LedPlugin::new(Duration::from_millis(5)),
            Arc::clone(&directory),
            Arc::new(TokioKernel::new()),
        )
        .unwrap();
        led.start(led_worker, StartOptions::default()).unwrap();

        directory.dispatch("led", "blink(on)", WAIT).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(led.plugin().ticks() > 2);

        assert!(led.stop().await);
        let ticks = led.plugin().ticks();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(led.plugin().ticks(), ticks);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_plugins_on_thread_kernel() {
        let directory = Directory::new_shared(4);
        let kernel = Arc::new(ThreadKernel::new());
        let counter = PluginHost::new(
            "counter",
            CounterPlugin::default(),
            Arc::clone(&directory),
            kernel.clone(),
        )
        .unwrap();
        let echo = PluginHost::new("echo", EchoPlugin, Arc::clone(&directory), kernel).unwrap();
        counter.start(idle, StartOptions::default()).unwrap();
        echo.start(idle, StartOptions::default()).unwrap();

        assert_eq!(directory.dispatch("counter", "inc(3)", WAIT).await.unwrap().as_str(), "3");
        assert_eq!(directory.dispatch("echo", "echo(hi)", WAIT).await.unwrap().as_str(), "hi");
        assert_eq!(directory.count(), 2);

        assert!(counter.stop().await);
        assert!(echo.stop().await);
        assert_eq!(directory.count(), 0);
    }
}
