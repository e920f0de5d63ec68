// Sonance
// Copyright (C) 2021  Wesley Merkel
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Matches incoming OSC messages against address and argument patterns.
//!
//! Routes are tried in registration order and the first one whose pattern fits the message and
//! whose handler returns `Some` wins.

use rosc::{OscMessage, OscType};
use std::collections::HashMap;

pub struct Router<T> {
    routes: Vec<Route<T>>,
}

impl<T> Default for Router<T> {
    fn default() -> Router<T> {
        Router { routes: Vec::new() }
    }
}

impl<T> Router<T> {
    /// Starts a new route for messages sent to `addr`. The route is registered when
    /// [`RouteBuilder::handle`] is called.
    pub fn addr(&mut self, addr: &'static str) -> RouteBuilder<'_, T> {
        RouteBuilder {
            router: self,
            addr,
            patterns: Vec::new(),
        }
    }

    pub fn route(&self, message: &OscMessage) -> Option<T> {
        self.routes.iter().find_map(|route| {
            let mut args = route.match_msg(message)?;
            (route.handler)(&mut args)
        })
    }
}

struct Route<T> {
    addr: &'static str,
    patterns: Vec<ArgPattern>,
    handler: Box<dyn Fn(&mut MatchedArgs) -> Option<T>>,
}

impl<T> Route<T> {
    fn match_msg(&self, message: &OscMessage) -> Option<MatchedArgs> {
        if message.addr != self.addr {
            return None;
        }

        let mut args = message.args.iter();
        let mut matched = MatchedArgs::default();
        for pattern in self.patterns.iter() {
            match pattern {
                ArgPattern::Expect(expected) => {
                    if args.next()? != expected {
                        return None;
                    }
                }
                ArgPattern::Capture(name) => {
                    matched.args.insert(name, args.next()?.clone());
                }
                ArgPattern::CaptureOptional(name) => {
                    if let Some(arg) = args.next() {
                        matched.args.insert(name, arg.clone());
                    }
                }
                ArgPattern::CaptureRest => {
                    matched.rest = Some(args.by_ref().cloned().collect());
                }
            }
        }
        if args.next().is_some() {
            return None;
        }
        Some(matched)
    }
}

pub struct RouteBuilder<'r, T> {
    router: &'r mut Router<T>,
    addr: &'static str,
    patterns: Vec<ArgPattern>,
}

impl<'r, T> RouteBuilder<'r, T> {
    pub fn expect_str(mut self, value: &'static str) -> Self {
        self.patterns.push(ArgPattern::Expect(value.into()));
        self
    }

    pub fn capture(mut self, name: &'static str) -> Self {
        self.patterns.push(ArgPattern::Capture(name));
        self
    }

    pub fn capture_optional(mut self, name: &'static str) -> Self {
        self.patterns.push(ArgPattern::CaptureOptional(name));
        self
    }

    pub fn capture_rest(mut self) -> Self {
        self.patterns.push(ArgPattern::CaptureRest);
        self
    }

    pub fn handle<F>(self, f: F)
    where
        F: Fn(&mut MatchedArgs) -> Option<T> + 'static,
    {
        self.router.routes.push(Route {
            addr: self.addr,
            patterns: self.patterns,
            handler: Box::new(f),
        })
    }
}

#[derive(Debug)]
enum ArgPattern {
    Expect(OscType),
    Capture(&'static str),
    CaptureOptional(&'static str),
    CaptureRest,
}

#[derive(Debug, Default)]
pub struct MatchedArgs {
    args: HashMap<&'static str, OscType>,
    rest: Option<Vec<OscType>>,
}

impl MatchedArgs {
    pub fn int(&mut self, name: &'static str) -> Option<i32> {
        match self.args.remove(name) {
            Some(OscType::Int(x)) => Some(x),
            _ => None,
        }
    }

    /// Captured numbers are accepted as either float width.
    pub fn float(&mut self, name: &'static str) -> Option<f32> {
        match self.args.remove(name) {
            Some(OscType::Float(x)) => Some(x),
            Some(OscType::Double(x)) => Some(x as f32),
            _ => None,
        }
    }

    pub fn double(&mut self, name: &'static str) -> Option<f64> {
        match self.args.remove(name) {
            Some(OscType::Double(x)) => Some(x),
            Some(OscType::Float(x)) => Some(x as f64),
            _ => None,
        }
    }

    pub fn string(&mut self, name: &'static str) -> Option<String> {
        match self.args.remove(name) {
            Some(OscType::String(x)) => Some(x),
            _ => None,
        }
    }

    pub fn rest(&mut self) -> Option<Vec<OscType>> {
        self.rest.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_route_wins() {
        let mut router = Router::default();
        router
            .addr("/done")
            .expect_str("/b_alloc")
            .capture("n")
            .handle(|args| Some(args.int("n")? * 10));
        router.addr("/done").capture_rest().handle(|_| Some(-1));

        assert_eq!(router.route(&message("/done", vec!["/b_alloc".into(), 3.into()])), Some(30));
        assert_eq!(router.route(&message("/done", vec!["/quit".into()])), Some(-1));
        assert_eq!(router.route(&message("/synced", vec![])), None);
    }

    #[test]
    fn trailing_arguments_reject_a_route() {
        let mut router = Router::default();
        router.addr("/synced").capture("id").handle(|args| args.int("id"));

        assert_eq!(router.route(&message("/synced", vec![1.into(), 2.into()])), None);
        assert_eq!(router.route(&message("/synced", vec![1.into()])), Some(1));
    }

    fn message(addr: &str, args: Vec<OscType>) -> OscMessage {
        OscMessage {
            addr: addr.to_owned(),
            args,
        }
    }
}
