//! Property tests for the synchronization primitives and the bus
//!
//! Properties:
//! - Lock holders are always mutually compatible: an exclusive holder is
//!   alone, and at most one upgradeable holder exists. This holds for
//!   immediate grants and for grants made from the wait queue, including
//!   upgrades and abandoned waits.
//! - Semaphore accounting never drifts: `held` equals the sum of per-agent
//!   grants, never exceeds the total, and over-release is always rejected.
//! - The bus delivers every message exactly once and keeps per-sender FIFO,
//!   total and causal order under interleaved traffic of every kind.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;

use conclave::{
    AgentId, BusConfig, ConclaveError, DeliveryOrder, EventLog, LockManager, LockMode, Message,
    MessageBus, MessageId, Priority, SemaphoreRegistry, SystemClock,
};
use proptest::prelude::*;
use proptest::sample::Index;
use serde_json::json;
use tokio_test::task::{self, Spawn};

const AGENTS: usize = 4;
const PERMITS: u32 = 5;

#[derive(Debug, Clone)]
enum LockOp {
    Acquire(usize, LockMode),
    Upgrade(usize),
    Release(usize),
}

#[derive(Debug, Clone)]
enum PermitOp {
    Acquire(usize, u32),
    Release(usize, u32),
}

fn arb_mode() -> impl Strategy<Value = LockMode> {
    prop_oneof![
        Just(LockMode::Exclusive),
        Just(LockMode::Shared),
        Just(LockMode::Upgradeable),
    ]
}

fn arb_lock_op() -> impl Strategy<Value = LockOp> {
    prop_oneof![
        (0..AGENTS, arb_mode()).prop_map(|(a, m)| LockOp::Acquire(a, m)),
        (0..AGENTS).prop_map(LockOp::Upgrade),
        (0..AGENTS).prop_map(LockOp::Release),
    ]
}

fn arb_permit_op() -> impl Strategy<Value = PermitOp> {
    prop_oneof![
        (0..AGENTS, 1..=PERMITS).prop_map(|(a, n)| PermitOp::Acquire(a, n)),
        (0..AGENTS, 1..=PERMITS).prop_map(|(a, n)| PermitOp::Release(a, n)),
    ]
}

fn agents() -> Vec<AgentId> {
    (0..AGENTS).map(|_| AgentId::new()).collect()
}

fn check_compatible(holders: &[(AgentId, LockMode)]) -> Result<(), TestCaseError> {
    let exclusive = holders.iter().filter(|(_, m)| *m == LockMode::Exclusive).count();
    let upgradeable = holders.iter().filter(|(_, m)| *m == LockMode::Upgradeable).count();
    prop_assert!(exclusive == 0 || holders.len() == 1, "holders: {:?}", holders);
    prop_assert!(upgradeable <= 1, "holders: {:?}", holders);
    Ok(())
}

// === Queued locks ===

const LONG: Duration = Duration::from_secs(3600);

type Wait<'a> = Spawn<Pin<Box<dyn Future<Output = conclave::Result<()>> + 'a>>>;

#[derive(Debug, Clone)]
enum QueuedOp {
    Acquire(usize, LockMode),
    Upgrade(usize),
    Release(usize),
    Abandon(usize),
    /// Release, then drop a wait the release may just have granted
    ReleaseThenAbandon(usize, usize),
}

#[derive(Debug, Clone, Copy)]
enum Asked {
    Mode(LockMode),
    Upgrade,
}

fn arb_queued_op() -> impl Strategy<Value = QueuedOp> {
    prop_oneof![
        3 => (0..AGENTS, arb_mode()).prop_map(|(a, m)| QueuedOp::Acquire(a, m)),
        1 => (0..AGENTS).prop_map(QueuedOp::Upgrade),
        3 => (0..AGENTS).prop_map(QueuedOp::Release),
        1 => (0..AGENTS).prop_map(QueuedOp::Abandon),
        1 => (0..AGENTS, 0..AGENTS).prop_map(|(a, b)| QueuedOp::ReleaseThenAbandon(a, b)),
    ]
}

fn release(
    locks: &LockManager,
    agents: &[AgentId],
    model: &mut HashMap<usize, LockMode>,
    i: usize,
) -> Result<(), TestCaseError> {
    if model.remove(&i).is_some() {
        prop_assert!(locks.release("resource", agents[i]).is_ok());
    } else {
        let not_held = matches!(
            locks.release("resource", agents[i]),
            Err(ConclaveError::NotHeld { .. })
        );
        prop_assert!(not_held);
    }
    Ok(())
}

// === Bus traffic ===

const SENDERS: usize = 3;

#[derive(Debug, Clone)]
enum Traffic {
    Direct(usize, Priority, DeliveryOrder),
    Publish(usize, Priority, DeliveryOrder),
    Broadcast(usize, Priority, DeliveryOrder),
    /// Causal reply to an earlier message the recipient was sent
    Reply(usize, Priority, Index),
    /// Message for the bystander only
    Aside(usize, Priority),
    Receive,
}

fn arb_priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Critical),
        Just(Priority::High),
        Just(Priority::Normal),
        Just(Priority::Low),
    ]
}

fn arb_order() -> impl Strategy<Value = DeliveryOrder> {
    prop_oneof![3 => Just(DeliveryOrder::Fifo), 1 => Just(DeliveryOrder::Total)]
}

fn arb_traffic() -> impl Strategy<Value = Traffic> {
    prop_oneof![
        3 => (0..SENDERS, arb_priority(), arb_order()).prop_map(|(s, p, o)| Traffic::Direct(s, p, o)),
        2 => (0..SENDERS, arb_priority(), arb_order()).prop_map(|(s, p, o)| Traffic::Publish(s, p, o)),
        1 => (0..SENDERS, arb_priority(), arb_order()).prop_map(|(s, p, o)| Traffic::Broadcast(s, p, o)),
        1 => (0..SENDERS, arb_priority(), any::<Index>()).prop_map(|(s, p, i)| Traffic::Reply(s, p, i)),
        1 => (0..SENDERS, arb_priority()).prop_map(|(s, p)| Traffic::Aside(s, p)),
        2 => Just(Traffic::Receive),
    ]
}

/// A message the recipient should get
struct Sent {
    id: MessageId,
    sender: usize,
    order: DeliveryOrder,
    predecessor: Option<MessageId>,
}

proptest! {
    #[test]
    fn lock_holders_stay_compatible(ops in prop::collection::vec(arb_lock_op(), 1..64)) {
        let locks = LockManager::new(SystemClock::shared(), EventLog::new(16));
        let agents = agents();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        for op in ops {
            match op {
                LockOp::Acquire(i, mode) => {
                    let _ = locks.try_acquire("resource", agents[i], mode);
                }
                LockOp::Upgrade(i) => {
                    // Upgrades that cannot be granted at once time out immediately
                    let _ = rt.block_on(locks.upgrade(
                        "resource",
                        agents[i],
                        Duration::ZERO,
                    ));
                }
                LockOp::Release(i) => {
                    let _ = locks.release("resource", agents[i]);
                }
            }

            check_compatible(&locks.holders("resource"))?;
            prop_assert_eq!(locks.queue_len("resource"), 0);
        }
    }

    #[test]
    fn semaphore_accounting_is_exact(ops in prop::collection::vec(arb_permit_op(), 1..64)) {
        let semaphores = SemaphoreRegistry::new(SystemClock::shared(), EventLog::new(16));
        semaphores.create("pool", PERMITS).unwrap();
        let agents = agents();
        let mut model: HashMap<usize, u32> = HashMap::new();

        for op in ops {
            match op {
                PermitOp::Acquire(i, n) => {
                    let held: u32 = model.values().sum();
                    let granted = semaphores.try_acquire("pool", agents[i], n).unwrap();
                    prop_assert_eq!(granted, held + n <= PERMITS);
                    if granted {
                        *model.entry(i).or_default() += n;
                    }
                }
                PermitOp::Release(i, n) => {
                    let held = model.get(&i).copied().unwrap_or(0);
                    match semaphores.release("pool", agents[i], n) {
                        Ok(()) => {
                            prop_assert!(n <= held);
                            *model.entry(i).or_default() -= n;
                        }
                        Err(ConclaveError::OverRelease { requested, held: reported, .. }) => {
                            prop_assert!(n > held);
                            prop_assert_eq!(requested, n);
                            prop_assert_eq!(reported, held);
                        }
                        Err(other) => prop_assert!(false, "unexpected error: {}", other),
                    }
                }
            }

            let expected: u32 = model.values().sum();
            prop_assert_eq!(semaphores.held("pool").unwrap(), expected);
            prop_assert!(expected <= PERMITS);
            prop_assert_eq!(semaphores.available("pool").unwrap(), PERMITS - expected);
            for (i, agent) in agents.iter().enumerate() {
                prop_assert_eq!(
                    semaphores.held_by("pool", agent).unwrap(),
                    model.get(&i).copied().unwrap_or(0)
                );
            }
        }
    }

    #[test]
    fn queued_lock_grants_stay_compatible(ops in prop::collection::vec(arb_queued_op(), 1..64)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let _runtime = rt.enter();
        let locks = LockManager::new(SystemClock::shared(), EventLog::new(16));
        let agents = agents();
        let mut model: HashMap<usize, LockMode> = HashMap::new();
        let mut waits: HashMap<usize, (Asked, Wait<'_>)> = HashMap::new();

        for op in ops {
            match op {
                QueuedOp::Acquire(i, mode) => {
                    if !model.contains_key(&i) && !waits.contains_key(&i) {
                        let wait: Pin<Box<dyn Future<Output = conclave::Result<()>> + '_>> =
                            Box::pin(locks.acquire("resource", agents[i], mode, LONG));
                        waits.insert(i, (Asked::Mode(mode), task::spawn(wait)));
                    }
                }
                QueuedOp::Upgrade(i) => {
                    if model.get(&i) == Some(&LockMode::Upgradeable) && !waits.contains_key(&i) {
                        let wait: Pin<Box<dyn Future<Output = conclave::Result<()>> + '_>> =
                            Box::pin(locks.upgrade("resource", agents[i], LONG));
                        waits.insert(i, (Asked::Upgrade, task::spawn(wait)));
                    }
                }
                QueuedOp::Release(i) => release(&locks, &agents, &mut model, i)?,
                QueuedOp::Abandon(i) => {
                    waits.remove(&i);
                }
                QueuedOp::ReleaseThenAbandon(i, j) => {
                    release(&locks, &agents, &mut model, i)?;
                    waits.remove(&j);
                }
            }

            let mut finished = Vec::new();
            for (i, (asked, wait)) in waits.iter_mut() {
                if let Poll::Ready(result) = wait.poll() {
                    finished.push((*i, *asked, result));
                }
            }
            for (i, asked, result) in finished {
                waits.remove(&i);
                match (asked, result) {
                    (Asked::Mode(mode), Ok(())) => {
                        model.insert(i, mode);
                    }
                    (Asked::Upgrade, Ok(())) => {
                        model.insert(i, LockMode::Exclusive);
                    }
                    (Asked::Upgrade, Err(ConclaveError::NotHeld { .. })) => {}
                    (_, Err(other)) => prop_assert!(false, "unexpected error: {}", other),
                }
            }

            let holders = locks.holders("resource");
            check_compatible(&holders)?;
            let mut expected: Vec<(AgentId, LockMode)> =
                model.iter().map(|(i, m)| (agents[*i], *m)).collect();
            expected.sort_by_key(|(a, _)| *a);
            prop_assert_eq!(&holders, &expected);
            prop_assert_eq!(locks.queue_len("resource"), waits.len());
            if holders.is_empty() {
                prop_assert!(waits.is_empty(), "waiters starve with no holder");
            }
        }
    }

    #[test]
    fn bus_order_survives_interleaved_traffic(traffic in prop::collection::vec(arb_traffic(), 1..96)) {
        let bus = MessageBus::new(BusConfig::default(), SystemClock::shared(), EventLog::new(16));
        let senders = agents();
        let (recipient, bystander) = (AgentId::new(), AgentId::new());
        for agent in senders.iter().take(SENDERS).chain([&recipient, &bystander]) {
            bus.register(*agent);
        }
        bus.subscribe(recipient, ["updates"]).unwrap();
        bus.subscribe(bystander, ["updates"]).unwrap();

        let mut sent: Vec<Sent> = Vec::new();
        let mut delivered: Vec<MessageId> = Vec::new();

        for (n, step) in traffic.into_iter().enumerate() {
            let payload = json!(n);
            let (message, expected) = match step {
                Traffic::Direct(s, p, o) => (
                    Message::direct(senders[s], recipient, payload).with_priority(p).with_order(o),
                    Some(s),
                ),
                Traffic::Publish(s, p, o) => (
                    Message::topic(senders[s], "updates", payload).with_priority(p).with_order(o),
                    Some(s),
                ),
                Traffic::Broadcast(s, p, o) => (
                    Message::broadcast(senders[s], payload).with_priority(p).with_order(o),
                    Some(s),
                ),
                Traffic::Reply(s, p, earlier) => {
                    if sent.is_empty() {
                        continue;
                    }
                    let predecessor = sent[earlier.index(sent.len())].id;
                    (
                        Message::direct(senders[s], recipient, payload).with_priority(p).after(predecessor),
                        Some(s),
                    )
                }
                Traffic::Aside(s, p) => (
                    Message::direct(senders[s], bystander, payload).with_priority(p),
                    None,
                ),
                Traffic::Receive => {
                    delivered.extend(bus.try_receive(recipient).unwrap().map(|e| e.id()));
                    continue;
                }
            };
            if let Some(sender) = expected {
                sent.push(Sent {
                    id: message.id,
                    sender,
                    order: message.order,
                    predecessor: message.causal_predecessor,
                });
            }
            bus.send(message).unwrap();
        }
        delivered.extend(bus.try_receive(recipient).unwrap().map(|e| e.id()));

        prop_assert_eq!(delivered.len(), sent.len());
        prop_assert_eq!(bus.pending(&recipient), 0);
        let position: HashMap<MessageId, usize> =
            delivered.iter().enumerate().map(|(at, id)| (*id, at)).collect();
        prop_assert_eq!(position.len(), sent.len());

        for sender in 0..SENDERS {
            let fifo: Vec<usize> = sent
                .iter()
                .filter(|m| m.sender == sender && m.order == DeliveryOrder::Fifo)
                .map(|m| position[&m.id])
                .collect();
            prop_assert!(fifo.windows(2).all(|w| w[0] < w[1]), "sender {} out of order", sender);
        }
        let total: Vec<usize> = sent
            .iter()
            .filter(|m| m.order == DeliveryOrder::Total)
            .map(|m| position[&m.id])
            .collect();
        prop_assert!(total.windows(2).all(|w| w[0] < w[1]));
        for reply in sent.iter().filter(|m| m.predecessor.is_some()) {
            let predecessor = reply.predecessor.map(|p| position[&p]);
            prop_assert!(predecessor < Some(position[&reply.id]));
        }
    }
}
