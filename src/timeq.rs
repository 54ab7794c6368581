/*
Latency/bandwidth servers for the toy memory system.

A request accepted by a `TimedServer` is charged a fixed base latency plus a transfer time derived
from its size and the configured bytes-per-cycle. The server keeps accepted work in FIFO order and
hands back each payload once its ticket matures, at most `completions_per_cycle` per call.

A full server refuses new work with `Backpressure`, which returns the request to the caller so it
can be retried on a later cycle.
*/

use std::collections::VecDeque;

pub type Cycle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    issued_at: Cycle,
    ready_at: Cycle,
    size_bytes: u32,
}

impl Ticket {
    pub fn issued_at(&self) -> Cycle {
        self.issued_at
    }

    pub fn ready_at(&self) -> Cycle {
        self.ready_at
    }

    pub fn size_bytes(&self) -> u32 {
        self.size_bytes
    }

    pub fn is_ready(&self, now: Cycle) -> bool {
        now >= self.ready_at
    }

    // Zero once the ticket has matured.
    pub fn remaining_cycles(&self, now: Cycle) -> Cycle {
        self.ready_at.saturating_sub(now)
    }
}

#[derive(Debug)]
pub struct ServiceRequest<T> {
    pub payload: T,
    pub size_bytes: u32,
}

impl<T> ServiceRequest<T> {
    pub fn new(payload: T, size_bytes: u32) -> Self {
        Self {
            payload,
            size_bytes,
        }
    }
}

#[derive(Debug)]
pub struct ServiceResult<T> {
    pub payload: T,
    pub ticket: Ticket,
}

#[derive(Debug)]
pub enum Backpressure<T> {
    QueueFull {
        request: ServiceRequest<T>,
        capacity: usize,
    },
}

impl<T> Backpressure<T> {
    pub fn into_request(self) -> ServiceRequest<T> {
        match self {
            Backpressure::QueueFull { request, .. } => request,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    pub base_latency: Cycle,
    pub bytes_per_cycle: u32,
    pub queue_capacity: usize,
    /// 0 drains every matured request at once.
    pub completions_per_cycle: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_latency: 0,
            bytes_per_cycle: 1,
            queue_capacity: 1,
            completions_per_cycle: 0,
        }
    }
}

#[derive(Debug)]
struct Inflight<T> {
    payload: T,
    ticket: Ticket,
}

#[derive(Debug)]
pub struct TimedServer<T> {
    config: ServerConfig,
    inflight: VecDeque<Inflight<T>>,
    // transfer pipe is occupied until this cycle
    link_free_at: Cycle,
}

impl<T> TimedServer<T> {
    pub fn new(config: ServerConfig) -> Self {
        assert!(config.bytes_per_cycle > 0, "bytes_per_cycle must be > 0");
        assert!(config.queue_capacity > 0, "queue_capacity must be > 0");
        Self {
            config,
            inflight: VecDeque::with_capacity(config.queue_capacity),
            link_free_at: 0,
        }
    }

    pub fn try_enqueue(
        &mut self,
        now: Cycle,
        request: ServiceRequest<T>,
    ) -> Result<Ticket, Backpressure<T>> {
        if self.inflight.len() >= self.config.queue_capacity {
            return Err(Backpressure::QueueFull {
                request,
                capacity: self.config.queue_capacity,
            });
        }

        let transfer = (request.size_bytes as u64).div_ceil(self.config.bytes_per_cycle as u64);
        let start = self.link_free_at.max(now);
        self.link_free_at = start.saturating_add(transfer);
        let ticket = Ticket {
            issued_at: now,
            ready_at: self.link_free_at.saturating_add(self.config.base_latency),
            size_bytes: request.size_bytes,
        };
        self.inflight.push_back(Inflight {
            payload: request.payload,
            ticket,
        });
        Ok(ticket)
    }

    // Hands matured payloads to `callback` in acceptance order.
    pub fn service_ready<F>(&mut self, now: Cycle, mut callback: F) -> usize
    where
        F: FnMut(ServiceResult<T>),
    {
        let limit = match self.config.completions_per_cycle {
            0 => usize::MAX,
            n => n as usize,
        };
        let mut served = 0;
        while served < limit && self.inflight.front().is_some_and(|f| f.ticket.is_ready(now)) {
            let Some(done) = self.inflight.pop_front() else {
                break;
            };
            callback(ServiceResult {
                payload: done.payload,
                ticket: done.ticket,
            });
            served += 1;
        }
        served
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    pub fn oldest_ticket(&self) -> Option<&Ticket> {
        self.inflight.front().map(|inflight| &inflight.ticket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(capacity: usize, completions: u32) -> TimedServer<u32> {
        TimedServer::new(ServerConfig {
            base_latency: 10,
            bytes_per_cycle: 4,
            queue_capacity: capacity,
            completions_per_cycle: completions,
        })
    }

    #[test]
    fn latency_includes_transfer_time() {
        let mut srv = server(4, 0);
        let ticket = srv.try_enqueue(5, ServiceRequest::new(1, 8)).unwrap();
        assert_eq!(ticket.ready_at(), 5 + 2 + 10);
        // second request waits behind the first transfer
        let ticket = srv.try_enqueue(5, ServiceRequest::new(2, 4)).unwrap();
        assert_eq!(ticket.ready_at(), 5 + 3 + 10);
    }

    #[test]
    fn full_server_hands_request_back() {
        let mut srv = server(1, 0);
        srv.try_enqueue(0, ServiceRequest::new(1, 4)).unwrap();
        let rejected = srv.try_enqueue(0, ServiceRequest::new(2, 4)).unwrap_err();
        assert_eq!(rejected.into_request().payload, 2);
    }

    #[test]
    fn completions_are_rate_limited() {
        let mut srv = server(4, 1);
        srv.try_enqueue(0, ServiceRequest::new(1, 4)).unwrap();
        srv.try_enqueue(0, ServiceRequest::new(2, 4)).unwrap();
        let mut seen = Vec::new();
        assert_eq!(srv.service_ready(100, |r| seen.push(r.payload)), 1);
        assert_eq!(srv.service_ready(100, |r| seen.push(r.payload)), 1);
        assert_eq!(seen, vec![1, 2]);
        assert!(srv.is_empty());
    }

    #[test]
    fn immature_tickets_stay_queued() {
        let mut srv = server(2, 0);
        let ticket = srv.try_enqueue(0, ServiceRequest::new(7, 4)).unwrap();
        assert_eq!(srv.service_ready(ticket.ready_at() - 1, |_| {}), 0);
        assert_eq!(srv.len(), 1);
        assert_eq!(srv.oldest_ticket().map(|t| t.remaining_cycles(0)), Some(11));
    }
}
