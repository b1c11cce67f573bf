//! Publish hooks.
//!
//! Observers attached to a [`PublishHooks`] list are called synchronously, in
//! the order they were attached, at three points of every publish:
//!
//! * before the message is stamped and validated; observers may mutate it,
//! * after the broker accepted it,
//! * after the broker nacked or returned it.
//!
//! An observer error stops dispatch and is returned to the publisher's caller.

use std::fmt;
use std::sync::Arc;

use crate::message::Message;
use crate::rabbitmq::amqp_client::PublishFailure;
use crate::rabbitmq::errors::{MessagingError, Result};

pub trait PublishObserver: Send + Sync {
    fn before_publish(&self, _message: &mut Message) -> anyhow::Result<()> {
        Ok(())
    }

    fn published(&self, _message: &Message) -> anyhow::Result<()> {
        Ok(())
    }

    fn publish_failed(&self, _message: &Message, _error: &PublishFailure) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct PublishHooks {
    observers: Vec<Arc<dyn PublishObserver>>,
}

impl PublishHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, observer: Arc<dyn PublishObserver>) -> &mut Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn before_publish(&self, message: &mut Message) -> Result<()> {
        for observer in &self.observers {
            observer.before_publish(message).map_err(MessagingError::HookError)?;
        }
        Ok(())
    }

    pub fn published(&self, message: &Message) -> Result<()> {
        for observer in &self.observers {
            observer.published(message).map_err(MessagingError::HookError)?;
        }
        Ok(())
    }

    pub fn publish_failed(&self, message: &Message, error: &PublishFailure) -> Result<()> {
        for observer in &self.observers {
            observer
                .publish_failed(message, error)
                .map_err(MessagingError::HookError)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PublishHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishHooks")
            .field("observers", &self.observers.len())
            .finish()
    }
}
