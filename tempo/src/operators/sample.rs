//! Clock-driven sampling of a stream.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tempo_time::{RelativeTimeInterval, Time, TimeSpan};

use crate::interpolators::{InterpolationResult, Interpolator};
use crate::message::Message;
use crate::stream::Stream;
use crate::streams::DeliveryPolicy;

struct SampleState<T> {
    next_tick: Option<Time>,
    buffer: VecDeque<Message<T>>,
}

impl<T: Clone + Send + 'static> Stream<T> {
    /// Emits, at every `interval` tick starting from the first message,
    /// the message nearest to the tick within `window`. Ticks with no
    /// in-window message emit nothing.
    pub fn sample(&self, interval: TimeSpan, window: RelativeTimeInterval) -> Stream<T> {
        assert!(interval > TimeSpan::ZERO, "sampling interval must be positive");
        let interpolator = Interpolator::<T>::reproducible_nearest(window);
        let close_interpolator = interpolator.clone();
        let state = Arc::new(Mutex::new(SampleState { next_tick: None, buffer: VecDeque::new() }));
        let close_state = Arc::clone(&state);

        self.unary_with_close(
            "Sample",
            DeliveryPolicy::Unlimited,
            move |message: Message<T>, output| {
                let mut state = state.lock().expect("sample state poisoned");
                if state.next_tick.is_none() {
                    state.next_tick = Some(message.originating_time());
                }
                state.buffer.push_back(message);
                // Resolve every tick the new knowledge settles.
                loop {
                    let tick = state.next_tick.expect("initialized above");
                    match interpolator.interpolate(tick, &state.buffer, None) {
                        InterpolationResult::Created { value, obsolete_time } => {
                            prune(&mut state.buffer, obsolete_time);
                            output.post(value, tick).expect("ticks advance monotonically");
                        }
                        InterpolationResult::DoesNotExist { obsolete_time } => {
                            prune(&mut state.buffer, obsolete_time);
                        }
                        InterpolationResult::InsufficientData => break,
                    }
                    state.next_tick = Some(tick + interval);
                }
            },
            move |time, output| {
                let mut state = close_state.lock().expect("sample state poisoned");
                // The stream is closed: remaining ticks resolve
                // definitively. Once the buffer is spent no further tick
                // can produce, so the loop is bounded by the data, not
                // by the closing time.
                if let Some(mut tick) = state.next_tick {
                    while tick <= time && !state.buffer.is_empty() {
                        match close_interpolator.interpolate(tick, &state.buffer, Some(time)) {
                            InterpolationResult::Created { value, obsolete_time } => {
                                prune(&mut state.buffer, obsolete_time);
                                output.post(value, tick).expect("ticks advance monotonically");
                            }
                            InterpolationResult::DoesNotExist { obsolete_time } => {
                                prune(&mut state.buffer, obsolete_time);
                            }
                            InterpolationResult::InsufficientData => break,
                        }
                        tick = tick + interval;
                    }
                    state.next_tick = Some(tick);
                }
                output.close(time);
            },
        )
    }
}

fn prune<T>(buffer: &mut VecDeque<Message<T>>, obsolete: Time) {
    while buffer
        .front()
        .is_some_and(|message| message.originating_time() <= obsolete)
    {
        buffer.pop_front();
    }
}
