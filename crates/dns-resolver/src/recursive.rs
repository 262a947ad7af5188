//! The recursive resolver: cache-first resolution, then a delegation
//! walk from the configured servers (root hints or proxies) down to
//! an authoritative answer, feeding everything learned along the way
//! back into the cache.

use async_recursion::async_recursion;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::time::timeout;

use dns_cache::entry::{
    Cent, CF_ADDITIONAL, CF_AUTH, CF_NOCACHE, DF_AUTH, DF_LOCAL, DF_NEGATIVE,
};
use dns_cache::store::LookupOutcome;
use dns_cache::unix_now;
use dns_types::protocol::edns::strip_opt;
use dns_types::protocol::rrinfo::is_cacheable;
use dns_types::protocol::types::*;

use crate::context::{NegPolicy, ResolverContext};
use crate::query::{exchange, query_upstreams, QueryOptions, ReplyVerdict};
use crate::servers::{QueryTarget, RejectPolicy};
use crate::CNAME_HOP_LIMIT;

/// How many delegation steps a single walk may take.  The real tree
/// is never this deep; hitting the limit means servers are bouncing
/// us around.
const MAX_DELEGATION_DEPTH: usize = 32;

/// How many glueless nameservers one delegation step will chase
/// addresses for before giving up on the rest.
const MAX_GLUELESS_NS: usize = 3;

/// An error that can occur when trying to resolve a domain.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum ResolutionError {
    /// Resolution took too long overall and was aborted.
    Timeout,
    /// Hit the recursion limit while following CNAMEs.
    RecursionLimit,
    /// Tried to resolve a question while resolving the same question.
    DuplicateQuestion { question: Question },
    /// Ran out of servers to ask.
    DeadEnd { question: Question },
}

impl std::fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ResolutionError::Timeout => write!(f, "timed out"),
            ResolutionError::RecursionLimit => write!(f, "CNAME chain too long"),
            ResolutionError::DuplicateQuestion { question } => {
                write!(f, "loop when answering '{question}'")
            }
            ResolutionError::DeadEnd { question } => {
                write!(f, "unable to answer '{question}'")
            }
        }
    }
}

impl std::error::Error for ResolutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// How a cache consultation went.
enum CacheStatus {
    /// Authoritative locally defined answer: return immediately.
    LocalAnswer(Cent),
    /// Locally negated: return NXDOMAIN immediately.
    LocalNameErr(Cent),
    /// Usable and fresh.
    Cached(Cent),
    /// Usable, but a requery is wanted; serve this if the requery
    /// fails.
    Stale(Cent),
    NotCached,
}

/// Resolve a question, consulting the cache first and walking
/// delegations from the configured upstreams when the cache cannot
/// answer.  The returned entry is the cache entry for the queried
/// name (negative for NXDOMAIN, possibly holding a negated RR set for
/// NODATA).
///
/// This has a 60s overall guard on top of the per-round timeouts.
///
/// # Errors
///
/// See `ResolutionError`.
pub async fn resolve(
    context: &mut ResolverContext<'_>,
    question: &Question,
) -> Result<Cent, ResolutionError> {
    if let Ok(res) = timeout(
        Duration::from_secs(60),
        resolve_notimeout(context, question, CNAME_HOP_LIMIT),
    )
    .await
    {
        res
    } else {
        tracing::debug!("timed out");
        Err(ResolutionError::Timeout)
    }
}

/// Timeout-less version of `resolve`.  `hops` bounds the CNAME chain.
#[async_recursion]
async fn resolve_notimeout<'a>(
    context: &mut ResolverContext<'a>,
    question: &Question,
    hops: usize,
) -> Result<Cent, ResolutionError> {
    if context.at_recursion_limit() {
        tracing::debug!("hit recursion limit");
        return Err(ResolutionError::RecursionLimit);
    }
    if context.is_duplicate_question(question) {
        tracing::debug!("hit duplicate question");
        return Err(ResolutionError::DuplicateQuestion {
            question: question.clone(),
        });
    }

    match cache_status(context, question) {
        CacheStatus::LocalAnswer(cent) => {
            context.metrics().local_hit();
            tracing::trace!("got local answer");
            Ok(cent)
        }
        CacheStatus::LocalNameErr(cent) => {
            context.metrics().local_hit();
            context.metrics().negative_hit();
            tracing::trace!("got local negation");
            Ok(cent)
        }
        CacheStatus::Cached(cent) => {
            context.metrics().cache_hit();
            if cent.is_negative() {
                context.metrics().negative_hit();
            }
            tracing::trace!("got cached answer");
            Ok(cent)
        }
        CacheStatus::Stale(cent) => {
            context.metrics().cache_miss();
            tracing::trace!("got stale answer, requerying");
            match resolve_remote(context, question, hops).await {
                Ok(fresh) => Ok(fresh),
                // stale beats nothing
                Err(_) => Ok(cent),
            }
        }
        CacheStatus::NotCached => {
            context.metrics().cache_miss();
            resolve_remote(context, question, hops).await
        }
    }
}

/// Classify what the cache knows about a question.
fn cache_status(context: &mut ResolverContext<'_>, question: &Question) -> CacheStatus {
    let now = unix_now();

    let Some((mut cent, outcome)) = context.cache.lookup(&question.name) else {
        return CacheStatus::NotCached;
    };

    match outcome {
        LookupOutcome::LocalNegativeAncestor => {
            // the ancestor negates the whole subtree; answer with a
            // negation for the queried name itself
            let neg = cent.neg.unwrap_or(dns_cache::entry::NegInfo { ttl: 0, ts: now });
            CacheStatus::LocalNameErr(Cent::new_negative(
                question.name.clone(),
                neg.ttl,
                neg.ts,
                DF_NEGATIVE | DF_LOCAL,
            ))
        }
        LookupOutcome::NegativeAncestor => {
            // an upstream NXDOMAIN for the ancestor took the whole
            // subtree with it, for as long as the negation is fresh
            match cent.neg {
                Some(neg) if !neg.timed_out(now) => {
                    let mut synthetic = Cent::new_negative(
                        question.name.clone(),
                        neg.ttl,
                        neg.ts,
                        (cent.flags & DF_AUTH) | DF_NEGATIVE,
                    );
                    synthetic.c_soa = cent.c_soa;
                    CacheStatus::Cached(synthetic)
                }
                _ => CacheStatus::NotCached,
            }
        }
        LookupOutcome::LocalAncestor => {
            // a locally defined zone shadows everything below it:
            // names without local data do not exist, full stop
            CacheStatus::LocalNameErr(Cent::new_negative(
                question.name.clone(),
                0,
                now,
                DF_NEGATIVE | DF_LOCAL | DF_AUTH,
            ))
        }
        LookupOutcome::Wildcard => {
            // serve the `*.<ancestor>` data under the queried name
            cent.name = question.name.clone();
            if cent.is_local() || cent.rrsets().all(|(_, rrs)| rrs.is_local()) {
                CacheStatus::LocalAnswer(cent)
            } else {
                exact_status(cent, question, now)
            }
        }
        LookupOutcome::Exact => exact_status(cent, question, now),
    }
}

fn exact_status(cent: Cent, question: &Question, now: u64) -> CacheStatus {
    if cent.is_negative() {
        if cent.flags & DF_LOCAL != 0 {
            return CacheStatus::LocalNameErr(cent);
        }
        let fresh = cent.neg.map_or(false, |neg| !neg.timed_out(now));
        return if fresh {
            CacheStatus::Cached(cent)
        } else {
            CacheStatus::NotCached
        };
    }

    match question.qtype {
        QueryType::Record(rtype) => {
            if let Some(rrs) = cent.rrset(rtype) {
                if rrs.is_local() {
                    CacheStatus::LocalAnswer(cent)
                } else if rrs.timed_out(now) {
                    CacheStatus::Stale(cent)
                } else {
                    CacheStatus::Cached(cent)
                }
            } else if rtype != RecordType::CNAME && cent.has_rr(RecordType::CNAME) {
                // the alias answers for every type it does not shadow
                let rrs = cent.rrset(RecordType::CNAME).unwrap();
                if rrs.is_local() {
                    CacheStatus::LocalAnswer(cent)
                } else if rrs.timed_out(now) {
                    CacheStatus::Stale(cent)
                } else {
                    CacheStatus::Cached(cent)
                }
            } else {
                CacheStatus::NotCached
            }
        }
        QueryType::Wildcard => {
            if cent.num_rrsets() == 0 {
                CacheStatus::NotCached
            } else if cent.rrsets().all(|(_, rrs)| rrs.is_local()) {
                CacheStatus::LocalAnswer(cent)
            } else if cent
                .rrsets()
                .any(|(_, rrs)| !rrs.is_local() && rrs.timed_out(now))
            {
                CacheStatus::Stale(cent)
            } else {
                CacheStatus::Cached(cent)
            }
        }
        // zone transfers and the obsolete mail query types are not
        // served from this cache
        _ => CacheStatus::NotCached,
    }
}

async fn resolve_remote<'a>(
    context: &mut ResolverContext<'a>,
    question: &Question,
    hops: usize,
) -> Result<Cent, ResolutionError> {
    context.push_question(question);
    let result = delegation_walk(context, question, hops).await;
    context.pop_question();

    match &result {
        Ok(_) => context.metrics().upstream_hit(),
        Err(_) => context.metrics().upstream_failure(),
    }

    result
}

/// One full walk: query the assembled server list, then follow
/// delegations (or a CNAME) until something answers.
async fn delegation_walk<'a>(
    context: &mut ResolverContext<'a>,
    question: &Question,
    hops: usize,
) -> Result<Cent, ResolutionError> {
    let dead_end = || ResolutionError::DeadEnd {
        question: question.clone(),
    };

    let mut targets = build_targets(context, &question.name);
    if targets.is_empty() {
        tracing::debug!("no servers apply to this name");
        return Err(dead_end());
    }

    for _depth in 0..MAX_DELEGATION_DEPTH {
        let opts = context.opts;
        let answer = query_upstreams(
            &targets,
            question,
            opts.par_queries,
            opts.global_timeout,
            &opts.query,
            context.servers,
            |message, _| reply_verdict(message),
        )
        .await
        .map_err(|_| dead_end())?;

        let mut message = answer.message;
        let target = answer.target;
        strip_opt(&mut message);

        // a poisoned answer is either a failure or a synthesized
        // NXDOMAIN, per the section's reject policy
        if let Some(address) = reject_hit(&message, &target) {
            context.metrics().reject();
            tracing::info!(%address, policy = ?target.reject_policy, "answer hit reject list");
            match target.reject_policy {
                RejectPolicy::Fail => {
                    targets.retain(|t| t.address != target.address);
                    if targets.is_empty() {
                        return Err(dead_end());
                    }
                    continue;
                }
                RejectPolicy::Negate => {
                    return Ok(negative_domain(context, question, &message, &target, true));
                }
            }
        }

        if message.header.rcode == Rcode::NameError {
            context.metrics().negative_hit();
            // keep the authority SOA around for the response's
            // authority section
            let _ = store_reply(context, question, &message, &target);
            return Ok(negative_domain(context, question, &message, &target, false));
        }

        if matches!(
            message.header.rcode,
            Rcode::ServerFailure | Rcode::NotImplemented | Rcode::Refused
        ) {
            // the tentative fallback: nothing better arrived
            return Err(dead_end());
        }

        // a truncated reply with no data is no reply at all
        if message.header.is_truncated && message.answers.is_empty() {
            targets.retain(|t| t.address != target.address);
            if targets.is_empty() {
                return Err(dead_end());
            }
            continue;
        }

        // a delegation-only zone must delegate; an answer without
        // NS/SOA there is a sinkhole
        match delegation_only_verdict(context, question, &message, &target) {
            DelegationOnly::Fine => (),
            DelegationOnly::TreatAsNxdomain => {
                context.metrics().negative_hit();
                return Ok(negative_domain(context, question, &message, &target, true));
            }
            DelegationOnly::TreatAsFailure => {
                targets.retain(|t| t.address != target.address);
                if targets.is_empty() {
                    return Err(dead_end());
                }
                continue;
            }
        }

        let stored = store_reply(context, question, &message, &target);

        if stored.answered {
            if let Some((cent, _)) = context.cache.lookup(&question.name) {
                return Ok(cent);
            }
            // NOCACHE data never made it in; answer from the reply
            // directly
            if let Some(cent) = stored.question_cent {
                return Ok(cent);
            }
            return Err(dead_end());
        }

        if let Some(cname) = stored.cname {
            // ensure the alias target is resolved too, then answer
            // with the entry holding the CNAME; the chain itself is
            // assembled at response time
            if hops == 0 {
                tracing::debug!("CNAME chain exhausted hop budget");
                return Err(ResolutionError::RecursionLimit);
            }
            if question.qtype != QueryType::Record(RecordType::CNAME) {
                let cname_question = Question {
                    name: cname,
                    qtype: question.qtype,
                    qclass: question.qclass,
                };
                // a broken tail still leaves a servable partial chain
                let _ = resolve_notimeout(context, &cname_question, hops - 1).await;
            }
            if let Some((cent, _)) = context.cache.lookup(&question.name) {
                return Ok(cent);
            }
            if let Some(cent) = stored.question_cent {
                return Ok(cent);
            }
            return Err(dead_end());
        }

        if let Some((owner, ns_names)) = stored.delegation {
            tracing::trace!(zone = %owner, "following delegation");
            targets = targets_for_delegation(context, &target, &owner, &ns_names, hops).await;
            if targets.is_empty() {
                return Err(dead_end());
            }
            continue;
        }

        // no answer, no alias, no delegation: this is a NODATA reply
        context.metrics().negative_hit();
        return Ok(nodata(context, question, &message, &target));
    }

    tracing::debug!("delegation walk went too deep");
    Err(dead_end())
}

fn reply_verdict(message: &Message) -> ReplyVerdict {
    match message.header.rcode {
        Rcode::NoError | Rcode::NameError => ReplyVerdict::Accept,
        Rcode::ServerFailure | Rcode::NotImplemented | Rcode::Refused
            if message.answers.is_empty() =>
        {
            ReplyVerdict::Tentative
        }
        _ => ReplyVerdict::Reject,
    }
}

/// The first answer address hitting the target's reject list, if any.
fn reject_hit(message: &Message, target: &QueryTarget) -> Option<IpAddr> {
    let sections = message
        .answers
        .iter()
        .chain(message.authority.iter())
        .chain(message.additional.iter());

    for rr in sections {
        let address = match &rr.rtype_with_data {
            RecordTypeWithData::A { address } => IpAddr::V4(*address),
            RecordTypeWithData::AAAA { address } => IpAddr::V6(*address),
            _ => continue,
        };
        if target.rejects(address) {
            return Some(address);
        }
    }

    None
}

enum DelegationOnly {
    Fine,
    TreatAsNxdomain,
    TreatAsFailure,
}

/// Enforcement for delegation-only zones (typically TLDs): servers
/// at or above such a zone must only ever hand out delegations.
fn delegation_only_verdict(
    context: &ResolverContext<'_>,
    question: &Question,
    message: &Message,
    target: &QueryTarget,
) -> DelegationOnly {
    let serving_depth = target
        .ns_scope
        .as_ref()
        .map_or(0, DomainName::content_label_count);

    for zone in &context.opts.delegation_only {
        if !question.name.is_subdomain_of(zone) || question.name == *zone {
            continue;
        }
        // only replies from servers at or above the zone are
        // constrained; below it, real answers are expected
        if serving_depth > zone.content_label_count() {
            continue;
        }

        let mut saw_delegation = false;
        let mut saw_out_of_zone = false;
        for rr in message.answers.iter().chain(message.authority.iter()) {
            match rr.rtype_with_data.rtype() {
                RecordType::NS | RecordType::SOA => {
                    if rr.name.is_subdomain_of(zone) && rr.name != *zone {
                        saw_delegation = true;
                    } else {
                        saw_out_of_zone = true;
                    }
                }
                _ => (),
            }
        }

        if saw_delegation {
            return DelegationOnly::Fine;
        }
        if saw_out_of_zone {
            return DelegationOnly::TreatAsFailure;
        }
        if !message.answers.is_empty() {
            // an answer out of thin air where a delegation belongs
            return DelegationOnly::TreatAsNxdomain;
        }
    }

    DelegationOnly::Fine
}

/// What `store_reply` extracted from a reply.
struct StoredReply {
    /// The answer section held records for the question.
    answered: bool,
    /// The question name is an alias for this name.
    cname: Option<DomainName>,
    /// The best (deepest enclosing) delegation on offer.
    delegation: Option<(DomainName, Vec<DomainName>)>,
    /// The entry built for the question name, whether or not the
    /// cache kept it.
    question_cent: Option<Cent>,
}

/// Sort a reply's records into cache entries and merge them in,
/// enforcing bailiwick rules, and work out what the reply amounts to.
fn store_reply(
    context: &mut ResolverContext<'_>,
    question: &Question,
    message: &Message,
    target: &QueryTarget,
) -> StoredReply {
    let now = unix_now();
    let aa = message.header.is_authoritative;

    let in_scope = |owner: &DomainName| {
        if !context.opts.paranoid || target.trusted {
            return true;
        }
        match &target.ns_scope {
            Some(scope) => owner.is_subdomain_of(scope),
            // configured servers have no scope restriction
            None => true,
        }
    };

    let mut cents: HashMap<DomainName, Cent> = HashMap::new();
    let sections: [(&[ResourceRecord], bool); 3] = [
        (&message.answers, false),
        (&message.authority, true),
        (&message.additional, true),
    ];

    for (records, off_topic) in sections {
        for rr in records {
            if rr.rclass != RecordClass::IN {
                continue;
            }
            let rtype = rr.rtype_with_data.rtype();
            if !is_cacheable(rtype) {
                continue;
            }
            if !in_scope(&rr.name) {
                tracing::debug!(owner = %rr.name, "dropping out-of-bailiwick record");
                continue;
            }

            let mut flags = target.cache_flags;
            if aa {
                flags |= CF_AUTH;
            }
            if off_topic {
                flags |= CF_ADDITIONAL;
            }
            if message.header.is_truncated {
                // partial data is served once but never kept
                flags |= CF_NOCACHE;
            }

            let cent = cents
                .entry(rr.name.clone())
                .or_insert_with(|| Cent::new(rr.name.clone(), if aa { DF_AUTH } else { 0 }));

            let _ = cent.add_record(rr.ttl, now, flags, rr.rtype_with_data.clone());
            // an RR set's TTL is the smallest of its records'
            if let Some(rrs) = cent.rrset_mut(rtype) {
                if rr.ttl < rrs.ttl {
                    rrs.ttl = rr.ttl;
                }
            }
        }
    }

    // authority hints for the question's entry
    let (best_ns, best_soa) = best_authority_owners(question, message);
    if let Some(cent) = cents.get_mut(&question.name) {
        cent.c_ns = best_ns
            .as_ref()
            .and_then(|n| u8::try_from(n.content_label_count()).ok());
        cent.c_soa = best_soa
            .as_ref()
            .and_then(|n| u8::try_from(n.content_label_count()).ok());
    }

    let answered = message
        .answers
        .iter()
        .any(|rr| rr.name == question.name && rr.rtype_with_data.matches(question.qtype));

    let cname = if answered {
        None
    } else {
        message.answers.iter().find_map(|rr| {
            if rr.name == question.name {
                if let RecordTypeWithData::CNAME { cname } = &rr.rtype_with_data {
                    return Some(cname.clone());
                }
            }
            None
        })
    };

    let delegation = if target.recursion_desired {
        // a proxy was supposed to answer outright
        None
    } else {
        find_delegation(question, message, target)
    };

    let question_cent = cents.get(&question.name).cloned();

    for (_, cent) in cents {
        context.cache.add_cache(cent, now);
    }

    StoredReply {
        answered,
        cname,
        delegation,
        question_cent,
    }
}

/// The deepest NS and SOA owners in the reply which enclose the
/// queried name.
fn best_authority_owners(
    question: &Question,
    message: &Message,
) -> (Option<DomainName>, Option<DomainName>) {
    let mut best_ns: Option<DomainName> = None;
    let mut best_soa: Option<DomainName> = None;

    for rr in message.answers.iter().chain(message.authority.iter()) {
        if !question.name.is_subdomain_of(&rr.name) {
            continue;
        }
        let best = match rr.rtype_with_data.rtype() {
            RecordType::NS => &mut best_ns,
            RecordType::SOA => &mut best_soa,
            _ => continue,
        };
        if best
            .as_ref()
            .map_or(true, |b| b.content_label_count() < rr.name.content_label_count())
        {
            *best = Some(rr.name.clone());
        }
    }

    (best_ns, best_soa)
}

/// Find a delegation deeper than the zone the answering server was
/// serving.  Owners which do not enclose the queried name are
/// ignored; a nameserver has no business redirecting us sideways.
fn find_delegation(
    question: &Question,
    message: &Message,
    target: &QueryTarget,
) -> Option<(DomainName, Vec<DomainName>)> {
    let current_depth = target
        .ns_scope
        .as_ref()
        .map_or(0, DomainName::content_label_count);

    let mut best_owner: Option<DomainName> = None;
    let mut ns_names: Vec<DomainName> = Vec::new();

    for rr in message.answers.iter().chain(message.authority.iter()) {
        if let RecordTypeWithData::NS { nsdname } = &rr.rtype_with_data {
            if !question.name.is_subdomain_of(&rr.name) {
                continue;
            }
            let depth = rr.name.content_label_count();
            if depth <= current_depth {
                continue;
            }
            match &best_owner {
                Some(owner) if owner.content_label_count() > depth => (),
                Some(owner) if *owner == rr.name => {
                    if !ns_names.contains(nsdname) {
                        ns_names.push(nsdname.clone());
                    }
                }
                _ => {
                    best_owner = Some(rr.name.clone());
                    ns_names = vec![nsdname.clone()];
                }
            }
        }
    }

    best_owner.map(|owner| (owner, ns_names))
}

/// Build query targets for a delegation, using glue from the cache
/// and resolving glueless nameserver names as needed.
async fn targets_for_delegation<'a>(
    context: &mut ResolverContext<'a>,
    parent: &QueryTarget,
    owner: &DomainName,
    ns_names: &[DomainName],
    hops: usize,
) -> Vec<QueryTarget> {
    let mut targets = Vec::new();

    let port = context.opts.upstream_port;
    for ns in ns_names {
        for address in cached_addresses(context, ns) {
            targets.push(QueryTarget::from_delegation(
                parent,
                address,
                port,
                owner.clone(),
            ));
        }
    }

    if !targets.is_empty() {
        return targets;
    }

    // no glue at all: chase the first few nameserver addresses
    // recursively
    for ns in ns_names.iter().take(MAX_GLUELESS_NS) {
        if hops == 0 {
            break;
        }
        let address_question = Question {
            name: ns.clone(),
            qtype: QueryType::Record(RecordType::A),
            qclass: QueryClass::Record(RecordClass::IN),
        };
        let _ = resolve_notimeout(context, &address_question, hops - 1).await;
        for address in cached_addresses(context, ns) {
            targets.push(QueryTarget::from_delegation(
                parent,
                address,
                port,
                owner.clone(),
            ));
        }
        if !targets.is_empty() {
            break;
        }
    }

    targets
}

/// Fresh cached addresses for a name, IPv4 first.
fn cached_addresses(context: &ResolverContext<'_>, name: &DomainName) -> Vec<IpAddr> {
    let now = unix_now();
    let mut addresses = Vec::new();

    if let Some(rrs) = context.cache.lookup_rrset(name, RecordType::A) {
        if !rrs.timed_out(now) {
            for record in &rrs.records {
                if let RecordTypeWithData::A { address } = record {
                    addresses.push(IpAddr::V4(*address));
                }
            }
        }
    }
    if let Some(rrs) = context.cache.lookup_rrset(name, RecordType::AAAA) {
        if !rrs.timed_out(now) {
            for record in &rrs.records {
                if let RecordTypeWithData::AAAA { address } = record {
                    addresses.push(IpAddr::V6(*address));
                }
            }
        }
    }

    addresses
}

/// The server list for a fresh walk: every configured section which
/// serves the name contributes its servers - except that a
/// root-server section is displaced by a fresh cached delegation
/// when one encloses the name, skipping the walk's upper steps.
fn build_targets(context: &ResolverContext<'_>, name: &DomainName) -> Vec<QueryTarget> {
    let mut targets = Vec::new();

    for section in context.sections.iter().filter(|s| s.applies_to(name)) {
        if section.rootserver {
            if let Some(cached) = targets_from_cached_delegation(context, name, section) {
                targets.extend(cached);
                continue;
            }
        }
        targets.extend(QueryTarget::from_section(section));
    }

    if let Ok(table) = context.servers.read() {
        targets.retain(|t| table.is_up(t.address));
    }

    targets
}

/// Targets built from the closest fresh cached NS set enclosing the
/// name, if any.
fn targets_from_cached_delegation(
    context: &ResolverContext<'_>,
    name: &DomainName,
    section: &crate::servers::ServerSection,
) -> Option<Vec<QueryTarget>> {
    let now = unix_now();
    let mut candidate = Some(name.clone());

    while let Some(zone) = candidate {
        if let Some(ns) = context.cache.lookup_rrset(&zone, RecordType::NS) {
            if !ns.timed_out(now) && !ns.records.is_empty() {
                let mut targets = Vec::new();
                for record in &ns.records {
                    if let RecordTypeWithData::NS { nsdname } = record {
                        for address in cached_addresses(context, nsdname) {
                            targets.push(QueryTarget {
                                address: SocketAddr::new(address, context.opts.upstream_port),
                                recursion_desired: false,
                                cache_flags: section.cache_flags()
                                    & !dns_cache::entry::CF_ROOTSERV,
                                trusted: section.trusted,
                                ns_scope: Some(zone.clone()),
                                timeout: section.timeout,
                                reject_v4: section.reject_v4.clone(),
                                reject_v6: section.reject_v6.clone(),
                                reject_policy: section.reject_policy,
                            });
                        }
                    }
                }
                if !targets.is_empty() {
                    return Some(targets);
                }
            }
        }
        if zone.is_root() {
            break;
        }
        candidate = zone.parent();
    }

    None
}

/// Whether negative caching applies, given the policy and the reply.
fn negation_allowed(policy: NegPolicy, aa: bool, from_proxy: bool) -> bool {
    match policy {
        NegPolicy::On => true,
        NegPolicy::Off => false,
        NegPolicy::Auth => aa,
        NegPolicy::Default => from_proxy || aa,
    }
}

/// The TTL for a negative answer: bounded by the authority SOA's own
/// TTL and its minimum field, when one is present.
fn soa_derived_ttl(message: &Message) -> Option<u32> {
    for rr in &message.authority {
        if let RecordTypeWithData::SOA { minimum, .. } = &rr.rtype_with_data {
            return Some((*minimum).min(rr.ttl));
        }
    }
    None
}

/// The label count of the authority SOA's owner, for the `c_soa`
/// hint.
fn soa_hint(question: &Question, message: &Message) -> Option<u8> {
    for rr in &message.authority {
        if rr.rtype_with_data.rtype() == RecordType::SOA
            && question.name.is_subdomain_of(&rr.name)
        {
            return u8::try_from(rr.name.content_label_count()).ok();
        }
    }
    None
}

/// Build (and, policy permitting, cache) a negative entry for an
/// NXDOMAIN answer.
fn negative_domain(
    context: &mut ResolverContext<'_>,
    question: &Question,
    message: &Message,
    target: &QueryTarget,
    forced: bool,
) -> Cent {
    let now = unix_now();
    let aa = message.header.is_authoritative || forced;
    let ttl = soa_derived_ttl(message).unwrap_or_else(|| context.cache.read().limits().neg_ttl);

    let mut flags = DF_NEGATIVE;
    if aa {
        flags |= DF_AUTH;
    }
    let mut cent = Cent::new_negative(question.name.clone(), ttl, now, flags);
    cent.c_soa = soa_hint(question, message);

    if negation_allowed(context.opts.neg_domain_pol, aa, target.recursion_desired) {
        context.cache.add_cache(cent.clone(), now);
    }

    cent
}

/// Build (and, policy permitting, cache) an entry with a negated RR
/// set for a NODATA answer.
fn nodata(
    context: &mut ResolverContext<'_>,
    question: &Question,
    message: &Message,
    target: &QueryTarget,
) -> Cent {
    let now = unix_now();
    let aa = message.header.is_authoritative;
    let ttl = soa_derived_ttl(message).unwrap_or_else(|| context.cache.read().limits().neg_ttl);

    let mut cent = Cent::new(question.name.clone(), if aa { DF_AUTH } else { 0 });
    cent.c_soa = soa_hint(question, message);
    if let QueryType::Record(rtype) = question.qtype {
        if is_cacheable(rtype) {
            let mut flags = target.cache_flags;
            if aa {
                flags |= CF_AUTH;
            }
            let _ = cent.add_negated_rrset(rtype, ttl, now, flags);

            if negation_allowed(context.opts.neg_rrs_pol, aa, target.recursion_desired) {
                context.cache.add_cache(cent.clone(), now);
            }
        }
    }

    cent
}

/// Bootstrap the current root-server address list: ask each seed for
/// the root NS set and collect the nameserver addresses from the
/// reply.  The first seed producing any addresses wins.
pub async fn rootserver_resolve(
    seeds: &[SocketAddr],
    opts: &QueryOptions,
    per_timeout: Duration,
) -> Vec<IpAddr> {
    let root_ns_question = Question {
        name: DomainName::root_domain(),
        qtype: QueryType::Record(RecordType::NS),
        qclass: QueryClass::Record(RecordClass::IN),
    };

    for seed in seeds {
        let Ok(reply) = exchange(*seed, &root_ns_question, false, per_timeout, opts).await
        else {
            continue;
        };

        let ns_names: Vec<DomainName> = reply
            .answers
            .iter()
            .filter_map(|rr| match &rr.rtype_with_data {
                RecordTypeWithData::NS { nsdname } if rr.name.is_root() => {
                    Some(nsdname.clone())
                }
                _ => None,
            })
            .collect();

        let mut addresses = Vec::new();
        for rr in reply.answers.iter().chain(reply.additional.iter()) {
            if !ns_names.contains(&rr.name) {
                continue;
            }
            match &rr.rtype_with_data {
                RecordTypeWithData::A { address } => addresses.push(IpAddr::V4(*address)),
                RecordTypeWithData::AAAA { address } => addresses.push(IpAddr::V6(*address)),
                _ => (),
            }
        }

        if !addresses.is_empty() {
            tracing::info!(seed = %seed, count = %addresses.len(), "discovered root servers");
            return addresses;
        }
    }

    tracing::warn!("root server discovery failed on all seeds");
    Vec::new()
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use dns_cache::entry::CF_LOCAL;
    use dns_cache::{Cache, SharedCache};
    use dns_types::protocol::types::test_util::*;

    use super::*;
    use crate::context::ResolverOpts;
    use crate::servers::new_shared_servers;

    fn question(name: &str, rtype: RecordType) -> Question {
        Question {
            name: domain(name),
            qtype: QueryType::Record(rtype),
            qclass: QueryClass::Record(RecordClass::IN),
        }
    }

    fn target_for_tests(trusted: bool, scope: Option<&str>) -> QueryTarget {
        QueryTarget {
            address: "127.0.0.1:53".parse().unwrap(),
            recursion_desired: false,
            cache_flags: 0,
            trusted,
            ns_scope: scope.map(domain),
            timeout: Duration::from_secs(5),
            reject_v4: vec![(Ipv4Addr::new(127, 0, 0, 0), 8)],
            reject_v6: Vec::new(),
            reject_policy: RejectPolicy::Negate,
        }
    }

    fn fresh_cache_with(cents: Vec<Cent>) -> SharedCache {
        let cache = SharedCache::new(Cache::default());
        let now = unix_now();
        for cent in cents {
            cache.add_cache(cent, now);
        }
        cache
    }

    fn cent_with_a(name: &str, flags: dns_cache::entry::Flags, a: Ipv4Addr) -> Cent {
        let mut cent = Cent::new(domain(name), 0);
        cent.add_record(
            300,
            unix_now(),
            flags,
            RecordTypeWithData::A { address: a },
        )
        .unwrap();
        cent
    }

    #[test]
    fn cache_status_local_beats_everything() {
        let opts = ResolverOpts::default();
        let servers = new_shared_servers();
        let cache = fresh_cache_with(vec![cent_with_a(
            "www.example.com.",
            CF_LOCAL,
            Ipv4Addr::LOCALHOST,
        )]);
        let mut context = ResolverContext::new(&opts, &[], &servers, &cache, 32);

        match cache_status(&mut context, &question("www.example.com.", RecordType::A)) {
            CacheStatus::LocalAnswer(cent) => assert!(cent.has_rr(RecordType::A)),
            _ => panic!("expected local answer"),
        }
    }

    #[test]
    fn cache_status_fresh_and_missing() {
        let opts = ResolverOpts::default();
        let servers = new_shared_servers();
        let cache = fresh_cache_with(vec![cent_with_a(
            "www.example.com.",
            0,
            Ipv4Addr::LOCALHOST,
        )]);
        let mut context = ResolverContext::new(&opts, &[], &servers, &cache, 32);

        assert!(matches!(
            cache_status(&mut context, &question("www.example.com.", RecordType::A)),
            CacheStatus::Cached(_)
        ));
        assert!(matches!(
            cache_status(&mut context, &question("www.example.com.", RecordType::MX)),
            CacheStatus::NotCached
        ));
        assert!(matches!(
            cache_status(&mut context, &question("other.example.com.", RecordType::A)),
            CacheStatus::NotCached
        ));
    }

    #[test]
    fn cache_status_negative_ancestor_short_circuits() {
        let opts = ResolverOpts::default();
        let servers = new_shared_servers();
        let cache = SharedCache::new(Cache::default());
        let now = unix_now();

        // an upstream NXDOMAIN cached for the parent answers for the
        // children too, without any more upstream traffic
        let mut negation = Cent::new_negative(domain("ads.example.com."), 900, now, DF_AUTH);
        negation.c_soa = Some(2);
        cache.add_cache(negation, now);

        let mut context = ResolverContext::new(&opts, &[], &servers, &cache, 32);
        match cache_status(&mut context, &question("x.ads.example.com.", RecordType::A)) {
            CacheStatus::Cached(cent) => {
                assert!(cent.is_negative());
                assert!(!cent.is_local());
                assert_eq!(domain("x.ads.example.com."), cent.name);
                // the enclosing zone's SOA hint travels with it
                assert_eq!(Some(2), cent.c_soa);
            }
            _ => panic!("expected a cached negation for the subtree"),
        }
    }

    #[test]
    fn cache_status_expired_negative_ancestor_requeries() {
        let opts = ResolverOpts::default();
        let servers = new_shared_servers();
        let cache = SharedCache::new(Cache::default());

        // a negation whose lifetime (with the latency floor) is long
        // gone
        cache.add_cache(
            Cent::new_negative(domain("ads.example.com."), 900, 1000, 0),
            unix_now(),
        );

        let mut context = ResolverContext::new(&opts, &[], &servers, &cache, 32);
        assert!(matches!(
            cache_status(&mut context, &question("x.ads.example.com.", RecordType::A)),
            CacheStatus::NotCached
        ));
    }

    #[test]
    fn cache_status_local_zone_root_negates_unknown_children() {
        let opts = ResolverOpts::default();
        let servers = new_shared_servers();
        let cache = SharedCache::new(Cache::default());
        let now = unix_now();

        let mut zone_root = Cent::new(domain("lan."), DF_LOCAL | DF_AUTH);
        zone_root
            .add_record(
                300,
                now,
                CF_LOCAL,
                RecordTypeWithData::A {
                    address: Ipv4Addr::new(10, 0, 0, 1),
                },
            )
            .unwrap();
        cache.add_cache(zone_root, now);

        let mut context = ResolverContext::new(&opts, &[], &servers, &cache, 32);
        match cache_status(&mut context, &question("bogus.lan.", RecordType::A)) {
            CacheStatus::LocalNameErr(cent) => {
                assert!(cent.is_negative());
                assert!(cent.is_local());
                assert_eq!(domain("bogus.lan."), cent.name);
            }
            _ => panic!("expected a local name error for the shadowed name"),
        }

        // the zone root itself still answers normally
        assert!(matches!(
            cache_status(&mut context, &question("lan.", RecordType::A)),
            CacheStatus::LocalAnswer(_)
        ));
    }

    #[test]
    fn cache_status_cname_answers_other_types() {
        let opts = ResolverOpts::default();
        let servers = new_shared_servers();

        let mut cent = Cent::new(domain("www.example.com."), 0);
        cent.add_record(
            300,
            unix_now(),
            0,
            RecordTypeWithData::CNAME {
                cname: domain("target.example.com."),
            },
        )
        .unwrap();
        let cache = fresh_cache_with(vec![cent]);
        let mut context = ResolverContext::new(&opts, &[], &servers, &cache, 32);

        assert!(matches!(
            cache_status(&mut context, &question("www.example.com.", RecordType::A)),
            CacheStatus::Cached(_)
        ));
    }

    #[test]
    fn reject_hit_finds_poisoned_answer() {
        let target = target_for_tests(true, None);
        let request = Message::from_question(1, question("www.example.com.", RecordType::A));
        let mut reply = request.make_response();
        reply.answers = vec![a_record("www.example.com.", Ipv4Addr::new(127, 0, 0, 1))];

        assert_eq!(
            Some(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))),
            reject_hit(&reply, &target)
        );

        reply.answers = vec![a_record("www.example.com.", Ipv4Addr::new(1, 2, 3, 4))];
        assert_eq!(None, reject_hit(&reply, &target));
    }

    #[test]
    fn find_delegation_requires_progress() {
        let request = Message::from_question(1, question("www.example.com.", RecordType::A));
        let mut reply = request.make_response();
        reply.authority = vec![ns_record("com.", "a.gtld-servers.net.")];

        // from a root-scope server, a com. delegation is progress
        let from_root = target_for_tests(true, None);
        assert_eq!(
            Some((domain("com."), vec![domain("a.gtld-servers.net.")])),
            find_delegation(&request.questions[0], &reply, &from_root)
        );

        // from a server already serving com., it is not
        let from_com = target_for_tests(true, Some("com."));
        assert_eq!(
            None,
            find_delegation(&request.questions[0], &reply, &from_com)
        );
    }

    #[test]
    fn find_delegation_prefers_deepest_owner() {
        let request = Message::from_question(1, question("www.example.com.", RecordType::A));
        let mut reply = request.make_response();
        reply.authority = vec![
            ns_record("com.", "a.gtld-servers.net."),
            ns_record("example.com.", "ns1.example.com."),
            ns_record("example.com.", "ns2.example.com."),
        ];

        let (owner, ns_names) =
            find_delegation(&request.questions[0], &reply, &target_for_tests(true, None))
                .unwrap();
        assert_eq!(domain("example.com."), owner);
        assert_eq!(
            vec![domain("ns1.example.com."), domain("ns2.example.com.")],
            ns_names
        );
    }

    #[test]
    fn find_delegation_ignores_sideways_owners() {
        let request = Message::from_question(1, question("www.example.com.", RecordType::A));
        let mut reply = request.make_response();
        reply.authority = vec![ns_record("example.net.", "ns1.example.net.")];

        assert_eq!(
            None,
            find_delegation(&request.questions[0], &reply, &target_for_tests(true, None))
        );
    }

    #[test]
    fn store_reply_drops_out_of_bailiwick_records_in_paranoid_mode() {
        let mut opts = ResolverOpts::default();
        opts.paranoid = true;
        let servers = new_shared_servers();
        let cache = SharedCache::new(Cache::default());
        let mut context = ResolverContext::new(&opts, &[], &servers, &cache, 32);

        let q = question("www.example.com.", RecordType::A);
        let request = Message::from_question(1, q.clone());
        let mut reply = request.make_response();
        reply.answers = vec![a_record("www.example.com.", Ipv4Addr::new(1, 2, 3, 4))];
        reply.additional = vec![a_record("www.victim.net.", Ipv4Addr::new(6, 6, 6, 6))];

        let untrusted = target_for_tests(false, Some("example.com."));
        let stored = store_reply(&mut context, &q, &reply, &untrusted);

        assert!(stored.answered);
        assert!(cache.lookup(&domain("www.example.com.")).is_some());
        assert!(cache.lookup(&domain("www.victim.net.")).is_none());
    }

    #[test]
    fn store_reply_keeps_everything_from_trusted_server() {
        let mut opts = ResolverOpts::default();
        opts.paranoid = true;
        let servers = new_shared_servers();
        let cache = SharedCache::new(Cache::default());
        let mut context = ResolverContext::new(&opts, &[], &servers, &cache, 32);

        let q = question("www.example.com.", RecordType::A);
        let request = Message::from_question(1, q.clone());
        let mut reply = request.make_response();
        reply.answers = vec![a_record("www.example.com.", Ipv4Addr::new(1, 2, 3, 4))];
        reply.additional = vec![a_record("mirror.example.net.", Ipv4Addr::new(5, 5, 5, 5))];

        let trusted = target_for_tests(true, Some("example.com."));
        store_reply(&mut context, &q, &reply, &trusted);

        assert!(cache.lookup(&domain("mirror.example.net.")).is_some());
    }

    #[test]
    fn store_reply_sets_authority_hints() {
        let opts = ResolverOpts::default();
        let servers = new_shared_servers();
        let cache = SharedCache::new(Cache::default());
        let mut context = ResolverContext::new(&opts, &[], &servers, &cache, 32);

        let q = question("www.example.com.", RecordType::A);
        let request = Message::from_question(1, q.clone());
        let mut reply = request.make_response();
        reply.answers = vec![a_record("www.example.com.", Ipv4Addr::new(1, 2, 3, 4))];
        reply.authority = vec![
            ns_record("example.com.", "ns1.example.com."),
            soa_record("example.com.", "ns1.example.com.", 900, 3600),
        ];

        store_reply(&mut context, &q, &reply, &target_for_tests(true, None));

        let (cent, _) = cache.lookup(&domain("www.example.com.")).unwrap();
        assert_eq!(Some(2), cent.c_ns);
        assert_eq!(Some(2), cent.c_soa);
    }

    #[test]
    fn soa_ttl_derivation() {
        let request = Message::from_question(1, question("gone.example.com.", RecordType::A));
        let mut reply = request.make_response();

        assert_eq!(None, soa_derived_ttl(&reply));

        reply.authority = vec![soa_record("example.com.", "ns1.example.com.", 900, 600)];
        assert_eq!(Some(600), soa_derived_ttl(&reply));

        reply.authority = vec![soa_record("example.com.", "ns1.example.com.", 300, 3600)];
        assert_eq!(Some(300), soa_derived_ttl(&reply));
    }

    #[test]
    fn negation_policy_matrix() {
        assert!(negation_allowed(NegPolicy::On, false, false));
        assert!(!negation_allowed(NegPolicy::Off, true, true));
        assert!(negation_allowed(NegPolicy::Auth, true, false));
        assert!(!negation_allowed(NegPolicy::Auth, false, true));
        assert!(negation_allowed(NegPolicy::Default, false, true));
        assert!(negation_allowed(NegPolicy::Default, true, false));
        assert!(!negation_allowed(NegPolicy::Default, false, false));
    }

    #[test]
    fn nxdomain_is_negatively_cached_with_soa_ttl() {
        let opts = ResolverOpts {
            neg_domain_pol: NegPolicy::On,
            ..ResolverOpts::default()
        };
        let servers = new_shared_servers();
        let cache = SharedCache::new(Cache::default());
        let mut context = ResolverContext::new(&opts, &[], &servers, &cache, 32);

        let q = question("nosuch.example.", RecordType::A);
        let request = Message::from_question(1, q.clone());
        let mut reply = request.make_response();
        reply.header.rcode = Rcode::NameError;
        reply.header.is_authoritative = true;
        reply.authority = vec![soa_record("example.", "ns.example.", 900, 3600)];

        let cent = negative_domain(
            &mut context,
            &q,
            &reply,
            &target_for_tests(true, None),
            false,
        );
        assert!(cent.is_negative());
        assert_eq!(Some(900), cent.neg.map(|neg| neg.ttl));

        // and a later lookup hits the negative entry without
        // upstream traffic
        match cache_status(&mut context, &q) {
            CacheStatus::Cached(cached) => assert!(cached.is_negative()),
            _ => panic!("expected cached negative entry"),
        }
    }

    #[test]
    fn nodata_negates_just_the_type() {
        let opts = ResolverOpts {
            neg_rrs_pol: NegPolicy::On,
            ..ResolverOpts::default()
        };
        let servers = new_shared_servers();
        let cache = SharedCache::new(Cache::default());
        let mut context = ResolverContext::new(&opts, &[], &servers, &cache, 32);

        let q = question("www.example.com.", RecordType::MX);
        let request = Message::from_question(1, q.clone());
        let mut reply = request.make_response();
        reply.header.is_authoritative = true;
        reply.authority = vec![soa_record("example.com.", "ns.example.com.", 900, 3600)];

        let cent = nodata(&mut context, &q, &reply, &target_for_tests(true, None));
        assert!(!cent.is_negative());
        assert!(cent.rrset(RecordType::MX).unwrap().is_negative());

        match cache_status(&mut context, &q) {
            CacheStatus::Cached(cached) => {
                assert!(cached.rrset(RecordType::MX).unwrap().is_negative());
            }
            _ => panic!("expected cached NODATA"),
        }
    }

    /// A one-shot mock upstream bound to a loopback UDP port.
    async fn mock_upstream(
        make_reply: impl Fn(Message) -> Message + Send + 'static,
    ) -> std::net::SocketAddr {
        let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((len, peer)) = sock.recv_from(&mut buf).await else {
                    return;
                };
                let request = Message::from_octets(&buf[..len]).unwrap();
                let octets = make_reply(request).to_octets().unwrap();
                let _ = sock.send_to(&octets, peer).await;
            }
        });
        address
    }

    fn root_section(address: std::net::SocketAddr) -> crate::servers::ServerSection {
        crate::servers::ServerSection {
            label: "roots".into(),
            addresses: vec![address.ip()],
            port: address.port(),
            timeout: Duration::from_secs(1),
            rootserver: true,
            proxy_only: false,
            purge_cache: true,
            nocache: false,
            trusted: true,
            rules: Vec::new(),
            default_include: true,
            reject_v4: Vec::new(),
            reject_v6: Vec::new(),
            reject_policy: RejectPolicy::Fail,
        }
    }

    #[tokio::test]
    async fn delegation_walk_follows_glue_to_an_answer() {
        // the authoritative server for example.com.
        let auth = mock_upstream(|request| {
            let mut reply = request.make_response();
            reply.header.is_authoritative = true;
            reply.answers = vec![a_record("www.example.com.", Ipv4Addr::new(93, 184, 216, 34))];
            reply.authority = vec![ns_record("example.com.", "ns1.example.com.")];
            reply
        })
        .await;

        // the "root", which hands out a delegation with glue pointing
        // at the authoritative mock
        let root = mock_upstream(|request| {
            let mut reply = request.make_response();
            reply.authority = vec![ns_record("example.com.", "ns1.example.com.")];
            reply.additional = vec![a_record("ns1.example.com.", Ipv4Addr::new(127, 0, 0, 1))];
            reply
        })
        .await;

        let opts = ResolverOpts {
            upstream_port: auth.port(),
            global_timeout: Duration::from_secs(5),
            ..ResolverOpts::default()
        };
        let sections = vec![root_section(root)];
        let servers = new_shared_servers();
        let cache = SharedCache::new(Cache::default());
        let mut context = ResolverContext::new(&opts, &sections, &servers, &cache, 32);

        let cent = resolve(&mut context, &question("www.example.com.", RecordType::A))
            .await
            .unwrap();

        assert!(cent.has_rr(RecordType::A));
        assert_eq!(Some(2), cent.c_ns);

        // the delegation and its glue are cached
        assert!(cache
            .lookup_rrset(&domain("example.com."), RecordType::NS)
            .is_some());
        assert!(cache
            .lookup_rrset(&domain("ns1.example.com."), RecordType::A)
            .is_some());

        // a second resolution comes straight from the cache
        let metrics = context.done();
        assert_eq!(1, metrics.upstream_hits);

        let mut context = ResolverContext::new(&opts, &sections, &servers, &cache, 32);
        let cent = resolve(&mut context, &question("www.example.com.", RecordType::A))
            .await
            .unwrap();
        assert!(cent.has_rr(RecordType::A));
        assert_eq!(1, context.done().cache_hits);
    }

    #[tokio::test]
    async fn proxy_answer_is_used_and_cached() {
        let proxy = mock_upstream(|request| {
            let mut reply = request.make_response();
            reply.answers = vec![a_record("www.example.net.", Ipv4Addr::new(1, 2, 3, 4))];
            reply
        })
        .await;

        let mut section = root_section(proxy);
        section.label = "proxy".into();
        section.rootserver = false;

        let opts = ResolverOpts {
            global_timeout: Duration::from_secs(5),
            ..ResolverOpts::default()
        };
        let sections = vec![section];
        let servers = new_shared_servers();
        let cache = SharedCache::new(Cache::default());
        let mut context = ResolverContext::new(&opts, &sections, &servers, &cache, 32);

        let cent = resolve(&mut context, &question("www.example.net.", RecordType::A))
            .await
            .unwrap();

        assert!(cent.has_rr(RecordType::A));
        assert!(cache
            .lookup_rrset(&domain("www.example.net."), RecordType::A)
            .is_some());
    }

    #[tokio::test]
    async fn reject_negate_synthesizes_nxdomain() {
        let poisoned = mock_upstream(|request| {
            let mut reply = request.make_response();
            reply.answers = vec![a_record("www.example.net.", Ipv4Addr::new(127, 0, 0, 1))];
            reply
        })
        .await;

        let mut section = root_section(poisoned);
        section.rootserver = false;
        section.reject_v4 = vec![(Ipv4Addr::new(127, 0, 0, 0), 8)];
        section.reject_policy = RejectPolicy::Negate;

        let opts = ResolverOpts {
            neg_domain_pol: NegPolicy::On,
            global_timeout: Duration::from_secs(5),
            ..ResolverOpts::default()
        };
        let sections = vec![section];
        let servers = new_shared_servers();
        let cache = SharedCache::new(Cache::default());
        let mut context = ResolverContext::new(&opts, &sections, &servers, &cache, 32);

        let cent = resolve(&mut context, &question("www.example.net.", RecordType::A))
            .await
            .unwrap();

        assert!(cent.is_negative());
        // and the negation is cached per policy
        let (cached, _) = cache.lookup(&domain("www.example.net.")).unwrap();
        assert!(cached.is_negative());
    }

    #[test]
    fn delegation_only_zone_rejects_sinkhole_answers() {
        let opts = ResolverOpts {
            delegation_only: vec![domain("com.")],
            ..ResolverOpts::default()
        };
        let servers = new_shared_servers();
        let cache = SharedCache::new(Cache::default());
        let context = ResolverContext::new(&opts, &[], &servers, &cache, 32);

        let q = question("www.example.com.", RecordType::A);
        let request = Message::from_question(1, q.clone());

        // a root-scope server answering with an address instead of a
        // delegation is a sinkhole
        let mut sinkhole = request.make_response();
        sinkhole.answers = vec![a_record("www.example.com.", Ipv4Addr::new(6, 6, 6, 6))];
        assert!(matches!(
            delegation_only_verdict(&context, &q, &sinkhole, &target_for_tests(true, None)),
            DelegationOnly::TreatAsNxdomain
        ));

        // a proper delegation is fine
        let mut delegating = request.make_response();
        delegating.authority = vec![ns_record("example.com.", "ns1.example.com.")];
        assert!(matches!(
            delegation_only_verdict(&context, &q, &delegating, &target_for_tests(true, None)),
            DelegationOnly::Fine
        ));

        // NS owners outside the zone are a failure
        let mut sideways = request.make_response();
        sideways.authority = vec![ns_record("example.net.", "ns1.example.net.")];
        assert!(matches!(
            delegation_only_verdict(&context, &q, &sideways, &target_for_tests(true, None)),
            DelegationOnly::TreatAsFailure
        ));

        // below the zone, answers are expected
        let deep = target_for_tests(true, Some("example.com."));
        assert!(matches!(
            delegation_only_verdict(&context, &q, &sinkhole, &deep),
            DelegationOnly::Fine
        ));
    }
}
