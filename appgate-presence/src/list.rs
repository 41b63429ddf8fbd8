//! Unified resource listings: filtering, sorting, pagination.
//!
//! Two modes. Streaming (the default) walks the kind's key range and stops
//! after `limit` matches, handing back the pagination key of the first item
//! of the next page. Sort mode loads everything, sorts with the per-kind
//! comparator and paginates the filtered, deduplicated slice in memory;
//! that is the price of a global sort or an exact total count.

use std::collections::{BTreeMap, HashSet};

use appgate_common::errors::{Error, Result};
use appgate_common::resource::{
    order, Kind, SortBy, SORT_FIELD_ADDRESS, SORT_FIELD_DESCRIPTION, SORT_FIELD_HOSTNAME,
    SORT_FIELD_NAME,
};

use crate::backend::{iterate_range, Item, Key};
use crate::events::AnyResource;
use crate::keyspace;
use crate::service::PresenceService;

/// A unified listing request.
#[derive(Debug, Clone)]
pub struct ListResourcesRequest {
    /// Which kind to list.
    pub resource_type: Kind,
    /// Namespace, for namespaced kinds.
    pub namespace: String,
    /// Page size; must be positive.
    pub limit: usize,
    /// Resume token from a previous response; empty starts from the top.
    pub start_key: String,
    /// Labels every returned resource must carry.
    pub labels: BTreeMap<String, String>,
    /// Search keywords, matched case-folded against kind-specific fields.
    pub search_keywords: Vec<String>,
    /// Predicate expression, e.g. `labels["env"] == "prod" && !(name == "x")`.
    pub predicate_expression: String,
    /// Requested sort; forces sort mode when set.
    pub sort_by: SortBy,
    /// Ask for the exact matching total; forces sort mode.
    pub need_total_count: bool,
}

impl Default for ListResourcesRequest {
    fn default() -> Self {
        Self {
            resource_type: Kind::Node,
            namespace: appgate_common::resource::DEFAULT_NAMESPACE.to_string(),
            limit: 0,
            start_key: String::new(),
            labels: BTreeMap::new(),
            search_keywords: Vec::new(),
            predicate_expression: String::new(),
            sort_by: SortBy::default(),
            need_total_count: false,
        }
    }
}

/// A unified listing response.
#[derive(Debug, Clone)]
pub struct ListResourcesResponse {
    /// The page of matching resources.
    pub resources: Vec<AnyResource>,
    /// Pagination key of the first item of the next page; empty when
    /// exhausted.
    pub next_key: String,
    /// Exact matching total, when requested.
    pub total_count: Option<usize>,
}

/// The compiled resource filter of one request.
pub struct MatchResourceFilter {
    labels: BTreeMap<String, String>,
    search_keywords: Vec<String>,
    predicate: Option<Predicate>,
}

impl MatchResourceFilter {
    /// Compile the filter, parsing the predicate expression once.
    pub fn new(req: &ListResourcesRequest) -> Result<Self> {
        let predicate = if req.predicate_expression.is_empty() {
            None
        } else {
            Some(Predicate::parse(&req.predicate_expression)?)
        };
        Ok(Self {
            labels: req.labels.clone(),
            search_keywords: req.search_keywords.clone(),
            predicate,
        })
    }

    /// True iff the resource passes labels, search and predicate.
    pub fn matches(&self, resource: &AnyResource) -> bool {
        let resource_labels = resource.all_labels();
        for (key, value) in &self.labels {
            if resource_labels.get(key) != Some(value) {
                return false;
            }
        }
        if !resource.match_search(&self.search_keywords) {
            return false;
        }
        if let Some(predicate) = &self.predicate {
            if !predicate.eval(resource.name(), &resource_labels) {
                return false;
            }
        }
        true
    }
}

impl PresenceService {
    /// List resources of one kind with filtering, pagination and optional
    /// sorting; see the module docs for the two modes.
    pub async fn list_resources(
        &self,
        req: &ListResourcesRequest,
    ) -> Result<ListResourcesResponse> {
        if req.limit == 0 {
            return Err(Error::bad_parameter("a positive limit is required"));
        }
        let filter = MatchResourceFilter::new(req)?;
        if !req.sort_by.is_empty() || req.need_total_count {
            self.list_sorted(req, &filter).await
        } else {
            self.list_streaming(req, &filter).await
        }
    }

    async fn list_streaming(
        &self,
        req: &ListResourcesRequest,
        filter: &MatchResourceFilter,
    ) -> Result<ListResourcesResponse> {
        let prefix = kind_prefix(req)?;
        let start = if req.start_key.is_empty() {
            prefix.clone()
        } else {
            prefix.child(&req.start_key)
        };

        let mut matched: Vec<AnyResource> = Vec::new();
        let kind = req.resource_type;
        iterate_range(
            self.backend().as_ref(),
            &start,
            &prefix.range_end(),
            0,
            |item| {
                let resource = decode_any(kind, item)?;
                if filter.matches(&resource) {
                    matched.push(resource);
                }
                Ok(matched.len() <= req.limit)
            },
        )
        .await?;

        let next_key = if matched.len() > req.limit {
            matched[req.limit].pagination_key()
        } else {
            String::new()
        };
        matched.truncate(req.limit);
        Ok(ListResourcesResponse {
            resources: matched,
            next_key,
            total_count: None,
        })
    }

    async fn list_sorted(
        &self,
        req: &ListResourcesRequest,
        filter: &MatchResourceFilter,
    ) -> Result<ListResourcesResponse> {
        let prefix = kind_prefix(req)?;
        let mut all: Vec<AnyResource> = Vec::new();
        let kind = req.resource_type;
        iterate_range(
            self.backend().as_ref(),
            &prefix,
            &prefix.range_end(),
            0,
            |item| {
                all.push(decode_any(kind, item)?);
                Ok(true)
            },
        )
        .await?;

        sort_resources(&mut all, &req.sort_by)?;
        fake_paginate(all, req, filter)
    }
}

fn kind_prefix(req: &ListResourcesRequest) -> Result<Key> {
    let ns = &req.namespace;
    Ok(match req.resource_type {
        Kind::AppServer => keyspace::app_servers_prefix(ns),
        Kind::Node => keyspace::nodes_prefix(ns),
        Kind::DatabaseServer => keyspace::db_servers_prefix(ns),
        Kind::KubeServer => keyspace::kube_servers_prefix(),
        Kind::WindowsDesktopService => keyspace::windows_desktop_services_prefix(),
        Kind::App => keyspace::apps_prefix(),
        other => {
            return Err(Error::not_implemented(format!(
                "listing {other} resources is not supported"
            )))
        }
    })
}

fn decode_any(kind: Kind, item: &Item) -> Result<AnyResource> {
    Ok(match kind {
        Kind::AppServer => AnyResource::AppServer(PresenceService::unmarshal(item)?),
        Kind::Node => AnyResource::Node(PresenceService::unmarshal(item)?),
        Kind::DatabaseServer => AnyResource::DatabaseServer(PresenceService::unmarshal(item)?),
        Kind::KubeServer => AnyResource::KubeServer(PresenceService::unmarshal(item)?),
        Kind::WindowsDesktopService => {
            AnyResource::WindowsDesktopService(PresenceService::unmarshal(item)?)
        }
        Kind::App => AnyResource::App(PresenceService::unmarshal(item)?),
        other => {
            return Err(Error::not_implemented(format!(
                "decoding {other} resources is not supported"
            )))
        }
    })
}

/// The per-kind identity used to deduplicate sorted listings.
fn dedup_key(resource: &AnyResource) -> String {
    match resource {
        AnyResource::App(app) => format!("{}\n{}", app.metadata.name, app.spec.public_addr),
        AnyResource::AppServer(server) => format!(
            "{}\n{}\n{}",
            server.metadata.name, server.spec.app.spec.public_addr, server.spec.host_id
        ),
        AnyResource::Node(node) => node.metadata.name.clone(),
        AnyResource::DatabaseServer(server) => {
            format!("{}\n{}", server.metadata.name, server.spec.host_id)
        }
        AnyResource::KubeServer(server) => {
            format!("{}\n{}", server.metadata.name, server.spec.host_id)
        }
        AnyResource::WindowsDesktopService(svc) => svc.metadata.name.clone(),
    }
}

fn sort_field_value(resource: &AnyResource, field: &str) -> Result<String> {
    let unsupported = || {
        Error::not_implemented(format!(
            "sorting {} by {field:?} is not supported",
            resource.kind()
        ))
    };
    match field {
        SORT_FIELD_NAME => Ok(resource.name().to_string()),
        SORT_FIELD_DESCRIPTION => match resource {
            AnyResource::App(app) => Ok(app.metadata.description.clone()),
            AnyResource::AppServer(server) => Ok(server.spec.app.metadata.description.clone()),
            AnyResource::DatabaseServer(server) => {
                Ok(server.spec.database.metadata.description.clone())
            }
            _ => Err(unsupported()),
        },
        SORT_FIELD_HOSTNAME => match resource {
            AnyResource::AppServer(server) => Ok(server.spec.hostname.clone()),
            AnyResource::Node(node) => Ok(node.spec.hostname.clone()),
            AnyResource::DatabaseServer(server) => Ok(server.spec.hostname.clone()),
            AnyResource::KubeServer(server) => Ok(server.spec.hostname.clone()),
            _ => Err(unsupported()),
        },
        SORT_FIELD_ADDRESS => match resource {
            AnyResource::App(app) => Ok(app.spec.public_addr.clone()),
            AnyResource::AppServer(server) => Ok(server.spec.app.spec.public_addr.clone()),
            AnyResource::Node(node) => Ok(node.spec.addr.clone()),
            AnyResource::WindowsDesktopService(svc) => Ok(svc.spec.addr.clone()),
            _ => Err(unsupported()),
        },
        _ => Err(unsupported()),
    }
}

fn sort_resources(resources: &mut [AnyResource], sort_by: &SortBy) -> Result<()> {
    if sort_by.is_empty() {
        return Ok(());
    }
    // Surface an unsupported field instead of sorting garbage.
    if let Some(first) = resources.first() {
        sort_field_value(first, &sort_by.field)?;
    }
    resources.sort_by(|a, b| {
        let a = sort_field_value(a, &sort_by.field).unwrap_or_default();
        let b = sort_field_value(b, &sort_by.field).unwrap_or_default();
        order(&a, &b, sort_by.is_desc)
    });
    Ok(())
}

fn fake_paginate(
    all: Vec<AnyResource>,
    req: &ListResourcesRequest,
    filter: &MatchResourceFilter,
) -> Result<ListResourcesResponse> {
    let mut seen = HashSet::new();
    let mut filtered = Vec::new();
    for resource in all {
        if filter.matches(&resource) && seen.insert(dedup_key(&resource)) {
            filtered.push(resource);
        }
    }
    let total = filtered.len();

    let start = if req.start_key.is_empty() {
        0
    } else {
        // Resume at the exact resource when it still exists; otherwise at
        // the first key past it so a concurrent delete does not stall the
        // iteration.
        filtered
            .iter()
            .position(|r| r.pagination_key() == req.start_key)
            .or_else(|| {
                filtered
                    .iter()
                    .position(|r| r.pagination_key() >= req.start_key)
            })
            .unwrap_or(total)
    };
    let end = (start + req.limit).min(total);
    let next_key = if end < total {
        filtered[end].pagination_key()
    } else {
        String::new()
    };
    let page = filtered[start..end].to_vec();

    Ok(ListResourcesResponse {
        resources: page,
        next_key,
        total_count: Some(total),
    })
}

// === Predicate expressions ===

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    AndAnd,
    OrOr,
    Bang,
    EqEq,
    NotEq,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(Error::bad_parameter("expected && in predicate"));
                }
                tokens.push(Token::AndAnd);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(Error::bad_parameter("expected || in predicate"));
                }
                tokens.push(Token::OrOr);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(Error::bad_parameter("expected == in predicate"));
                }
                tokens.push(Token::EqEq);
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(c) => s.push(c),
                        None => {
                            return Err(Error::bad_parameter(
                                "unterminated string in predicate",
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(Error::bad_parameter(format!(
                    "unexpected {other:?} in predicate"
                )))
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Operand {
    Name,
    Label(String),
}

#[derive(Debug, Clone)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Eq(Operand, String),
    Ne(Operand, String),
    HasPrefix(Operand, String),
    Exists(String),
}

/// A parsed predicate expression.
#[derive(Debug, Clone)]
pub(crate) struct Predicate {
    expr: Expr,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        match self.next() {
            Some(found) if found == token => Ok(()),
            found => Err(Error::bad_parameter(format!(
                "expected {token:?} in predicate, found {found:?}"
            ))),
        }
    }

    fn or(&mut self) -> Result<Expr> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Bang) {
            self.next();
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.peek() == Some(&Token::LParen) {
            self.next();
            let expr = self.or()?;
            self.expect(Token::RParen)?;
            return Ok(expr);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Ident(ident)) if ident == "hasPrefix" => {
                self.expect(Token::LParen)?;
                let operand = self.operand_from_next()?;
                self.expect(Token::Comma)?;
                let prefix = self.string()?;
                self.expect(Token::RParen)?;
                Ok(Expr::HasPrefix(operand, prefix))
            }
            Some(Token::Ident(ident)) if ident == "exists" => {
                self.expect(Token::LParen)?;
                let operand = self.operand_from_next()?;
                self.expect(Token::RParen)?;
                match operand {
                    Operand::Label(key) => Ok(Expr::Exists(key)),
                    Operand::Name => Err(Error::bad_parameter(
                        "exists() takes a label operand",
                    )),
                }
            }
            Some(token) => {
                let operand = self.operand(token)?;
                match self.next() {
                    Some(Token::EqEq) => Ok(Expr::Eq(operand, self.string()?)),
                    Some(Token::NotEq) => Ok(Expr::Ne(operand, self.string()?)),
                    found => Err(Error::bad_parameter(format!(
                        "expected comparison in predicate, found {found:?}"
                    ))),
                }
            }
            None => Err(Error::bad_parameter("unexpected end of predicate")),
        }
    }

    fn operand_from_next(&mut self) -> Result<Operand> {
        match self.next() {
            Some(token) => self.operand(token),
            None => Err(Error::bad_parameter("unexpected end of predicate")),
        }
    }

    fn operand(&mut self, token: Token) -> Result<Operand> {
        match token {
            Token::Ident(ident) if ident == "name" || ident == "resource.metadata.name" => {
                Ok(Operand::Name)
            }
            Token::Ident(ident) if ident == "labels" => {
                self.expect(Token::LBracket)?;
                let key = self.string()?;
                self.expect(Token::RBracket)?;
                Ok(Operand::Label(key))
            }
            found => Err(Error::bad_parameter(format!(
                "unknown operand {found:?} in predicate"
            ))),
        }
    }

    fn string(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(s),
            found => Err(Error::bad_parameter(format!(
                "expected string in predicate, found {found:?}"
            ))),
        }
    }
}

impl Predicate {
    pub(crate) fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or()?;
        if parser.peek().is_some() {
            return Err(Error::bad_parameter("trailing input in predicate"));
        }
        Ok(Self { expr })
    }

    pub(crate) fn eval(&self, name: &str, labels: &BTreeMap<String, String>) -> bool {
        eval_expr(&self.expr, name, labels)
    }
}

fn eval_expr(expr: &Expr, name: &str, labels: &BTreeMap<String, String>) -> bool {
    let operand_value = |operand: &Operand| -> Option<String> {
        match operand {
            Operand::Name => Some(name.to_string()),
            Operand::Label(key) => labels.get(key).cloned(),
        }
    };
    match expr {
        Expr::Or(a, b) => eval_expr(a, name, labels) || eval_expr(b, name, labels),
        Expr::And(a, b) => eval_expr(a, name, labels) && eval_expr(b, name, labels),
        Expr::Not(inner) => !eval_expr(inner, name, labels),
        Expr::Eq(operand, value) => operand_value(operand).as_deref() == Some(value),
        Expr::Ne(operand, value) => operand_value(operand).as_deref() != Some(value.as_str()),
        Expr::HasPrefix(operand, prefix) => operand_value(operand)
            .map(|v| v.starts_with(prefix))
            .unwrap_or(false),
        Expr::Exists(key) => labels.contains_key(key),
    }
}
